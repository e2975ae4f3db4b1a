//! Display ordering of messages interleaved with publish markers.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::core::types::{Message, Revision};

/// One entry of the reconstructed conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItem<'a> {
    Message { message: &'a Message },
    RevisionMarker { revision: &'a Revision },
}

/// Interleave revisions into the message sequence.
///
/// A revision anchored to a message in `messages` is placed right after that
/// message; several revisions on one anchor keep their input order. Revisions
/// with no anchor, or an anchor that is not among `messages`, are appended at
/// the end in input (publish) order.
pub fn build_timeline<'a>(
    messages: &'a [Message],
    revisions: &'a [Revision],
) -> Vec<TimelineItem<'a>> {
    let known: HashSet<i64> = messages.iter().map(|m| m.id).collect();
    let mut by_anchor: HashMap<i64, Vec<&Revision>> = HashMap::new();
    let mut orphans = Vec::new();
    for revision in revisions {
        match revision.after_message_id {
            Some(anchor) if known.contains(&anchor) => {
                by_anchor.entry(anchor).or_default().push(revision);
            }
            _ => orphans.push(revision),
        }
    }

    let mut items = Vec::with_capacity(messages.len() + revisions.len());
    for message in messages {
        items.push(TimelineItem::Message { message });
        if let Some(anchored) = by_anchor.get(&message.id) {
            items.extend(
                anchored
                    .iter()
                    .map(|revision| TimelineItem::RevisionMarker { revision }),
            );
        }
    }
    items.extend(
        orphans
            .into_iter()
            .map(|revision| TimelineItem::RevisionMarker { revision }),
    );
    items
}
