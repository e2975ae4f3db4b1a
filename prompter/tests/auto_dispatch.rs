//! End-to-end polling scenarios: a message sent while the working copy is
//! still being cloned is answered automatically once it becomes ready.

use std::time::Duration;

use prompter::Prompter;
use prompter::core::types::Role;
use prompter::dispatch::StatusReport;
use prompter::io::config::PrompterConfig;
use prompter::io::store::Store;
use prompter::provisioning::ProvisioningStatus;
use prompter::service::{Collaborators, SendOutcome};
use prompter::test_support::{Harness, reply_json};

/// Poll until a report carries a delivered reply.
async fn poll_until_delivered(prompter: &Prompter, id: i64) -> StatusReport {
    for _ in 0..500 {
        let report = prompter.poll_status(id).await.expect("poll");
        if report.delivered.is_some() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no reply delivered for conversation {id}");
}

/// cloning -> deferred send -> ready -> processing -> responded -> delivered
/// once -> ready without a polling directive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_message_is_answered_after_clone() {
    let h = Harness::new();
    h.provisioner.close_gate();
    let conv = h
        .prompter
        .create_conversation("github.com/acme/widgets")
        .expect("create");

    let report = h.prompter.poll_status(conv.id).await.expect("poll");
    assert_eq!(report.status, ProvisioningStatus::Cloning);
    assert!(report.keep_polling);
    assert_eq!(report.last_message_id, None);

    let outcome = h
        .prompter
        .send_message(conv.id, "add a dark mode")
        .await
        .expect("send");
    let SendOutcome::Deferred { user_message, status } = outcome else {
        panic!("send must be deferred while cloning");
    };
    assert_eq!(status, ProvisioningStatus::Cloning);
    assert_eq!(h.assistant.call_count(), 0);

    h.assistant.push_reply(reply_json("Which screens need it?"));
    h.provisioner.open_gate();
    h.wait_for_status(conv.id, ProvisioningStatus::Ready).await;

    let report = h.prompter.poll_status(conv.id).await.expect("poll");
    assert_eq!(report.status, ProvisioningStatus::Processing);
    assert!(report.keep_polling);
    assert_eq!(report.last_message_id, Some(user_message.id));

    h.wait_for_status(conv.id, ProvisioningStatus::Responded).await;
    let delivered = h.prompter.poll_status(conv.id).await.expect("poll");
    assert_eq!(delivered.status, ProvisioningStatus::Ready);
    assert!(!delivered.keep_polling);
    let reply = delivered.delivered.expect("reply delivered");
    assert_eq!(reply.message.content, "Which screens need it?");
    assert_eq!(reply.message.role, Role::Assistant);

    let after = h.prompter.poll_status(conv.id).await.expect("poll");
    assert_eq!(after.status, ProvisioningStatus::Ready);
    assert!(after.delivered.is_none());
    assert!(!after.keep_polling);

    let calls = h.assistant.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].message, "add a dark mode");
    assert!(!calls[0].resume);

    let view = h.prompter.conversation_view(conv.id).expect("view");
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.conversation.title, "Which screens need it?");
}

/// A client whose delivery was consumed by another poller notices the newer
/// `last_message_id` and reloads the conversation.
#[tokio::test]
async fn missed_delivery_is_recovered_by_reloading() {
    let h = Harness::new();
    h.provisioner.close_gate();
    let conv = h
        .prompter
        .create_conversation("github.com/acme/widgets")
        .expect("create");
    let SendOutcome::Deferred { user_message, .. } = h
        .prompter
        .send_message(conv.id, "hello")
        .await
        .expect("send")
    else {
        panic!("send must be deferred while cloning");
    };
    h.provisioner.open_gate();
    h.wait_for_status(conv.id, ProvisioningStatus::Ready).await;

    // Another tab consumes the delivery.
    poll_until_delivered(&h.prompter, conv.id).await;

    let report = h.prompter.poll_status(conv.id).await.expect("poll");
    assert!(report.delivered.is_none());
    let newest = report.last_message_id.expect("last message id");
    assert!(newest > user_message.id, "client is behind and must reload");

    let view = h.prompter.conversation_view(conv.id).expect("view");
    assert_eq!(view.last_message_id(), Some(newest));
    assert_eq!(view.messages.last().map(|m| m.role), Some(Role::Assistant));
}

/// After a restart the provisioning table is empty; a pending user message
/// is still dispatched once the working copy is found on disk.
#[tokio::test]
async fn pending_message_survives_restart() {
    let h = Harness::on_disk().expect("harness");
    let conv = h.ready_conversation("github.com/acme/widgets").await;
    h.store
        .create_message(conv.id, Role::User, "left over", None)
        .expect("message");

    let restarted = Prompter::new(
        PrompterConfig::default(),
        Collaborators {
            store: h.store.clone(),
            assistant: h.assistant.clone(),
            provisioner: h.provisioner.clone(),
            issues: h.issues.clone(),
        },
    );
    assert_eq!(restarted.provisioning_entry(conv.id), None);

    let report = poll_until_delivered(&restarted, conv.id).await;
    assert_eq!(report.status, ProvisioningStatus::Ready);
    assert_eq!(h.assistant.calls()[0].message, "left over");
    assert_eq!(h.provisioner.calls(), 1, "restart does not re-clone");
}
