//! Shared application state for the API server.

use prompter::Prompter;

/// State handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub prompter: Prompter,
}

impl AppState {
    pub fn new(prompter: Prompter) -> Self {
        Self { prompter }
    }
}
