use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use otx_client::db::MemSessionStore;
use otx_client::{
    DeliveryState, NumberPurpose, ReplyStatus, Session, SessionBuilder, SessionConfig,
    SessionError,
};
use otx_core::message::{Command, CommandKind, OutboundTransaction, ReplyBody};
use otx_core::nymbox::BoxReceipt;
use otx_core::transport::TransportEvent;
use otx_core::workflow::{Workflow, WorkflowEvent};
use otx_core::{AccountId, NotaryId, NymId};
use otx_testing::notary::REJECTED_INSTRUMENT;
use otx_testing::{FakeNotary, FakeSigner, Fault};

#[derive(Debug, Default)]
struct RecordingWorkflow {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingWorkflow {
    fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Workflow for RecordingWorkflow {
    fn process(&self, event: WorkflowEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct Fixture {
    notary: Arc<FakeNotary>,
    store: Arc<MemSessionStore>,
    workflow: Arc<RecordingWorkflow>,
}

impl Fixture {
    fn new(notary: FakeNotary) -> Self {
        Self {
            notary: Arc::new(notary),
            store: Arc::new(MemSessionStore::new()),
            workflow: Arc::new(RecordingWorkflow::default()),
        }
    }

    fn session(&self, nym: &str) -> Session {
        self.session_with(nym, SessionConfig::default())
    }

    fn session_with(&self, nym: &str, config: SessionConfig) -> Session {
        SessionBuilder::new(
            NotaryId::from("notary"),
            Arc::new(FakeSigner::new(nym)),
            self.notary.clone(),
        )
        .with_store(self.store.clone())
        .with_workflow(self.workflow.clone())
        .with_config(config)
        .build()
        .unwrap()
    }

    fn kinds(&self) -> Vec<CommandKind> {
        self.notary
            .requests()
            .iter()
            .map(|request| request.kind())
            .collect()
    }
}

fn alice() -> NymId {
    NymId::from("alice")
}

fn notarize(number: u64, instrument: &str) -> Command {
    Command::NotarizeTransaction {
        transaction: OutboundTransaction {
            number,
            account: AccountId::from("usd-1"),
            instrument: instrument.into(),
        },
    }
}

/// Session holding numbers 5, 6 and 7
async fn with_numbers(fixture: &Fixture) -> Session {
    let session = fixture.session("alice");
    let result = session
        .queue(Command::GetTransactionNumbers { count: 3 })
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    session
}

#[test_log::test(tokio::test)]
async fn granted_numbers_are_accepted_through_the_nymbox() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = fixture.session("alice");

    let result = session
        .queue(Command::GetTransactionNumbers { count: 3 })
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert_matches!(
        result.reply.map(|reply| reply.body),
        Some(ReplyBody::GetTransactionNumbers)
    );

    let numbers = BTreeSet::from([5, 6, 7]);
    assert_eq!(session.issued(), numbers);
    assert_eq!(session.available(), numbers);
    assert!(session.tentative().is_empty());
    assert_eq!(session.highest(), 7);
    assert_eq!(fixture.notary.issued(&alice()), numbers);
    assert_eq!(fixture.notary.nymbox_len(&alice()), 0);
    assert_eq!(session.delivery_state(), DeliveryState::Idle);
    assert_eq!(session.last_status(), ReplyStatus::ValidReply);
    assert_eq!(
        fixture.kinds(),
        vec![
            CommandKind::GetTransactionNumbers,
            CommandKind::GetNymbox,
            CommandKind::GetBoxReceipt,
            CommandKind::ProcessNymbox,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn final_receipt_closes_a_number() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = with_numbers(&fixture).await;

    fixture.notary.push_receipt(
        &alice(),
        BoxReceipt::FinalReceipt {
            closing: BTreeSet::from([6]),
        },
    );
    let result = session.refresh_nymbox().unwrap().await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert_eq!(
        result.reply.map(|reply| reply.kind()),
        Some(CommandKind::ProcessNymbox)
    );
    assert_eq!(session.issued(), BTreeSet::from([5, 7]));
    assert_eq!(session.available(), BTreeSet::from([5, 7]));
    assert_eq!(fixture.notary.issued(&alice()), BTreeSet::from([5, 7]));

    // nothing left to do
    let again = session.refresh_nymbox().unwrap().await;
    assert_eq!(again.status, ReplyStatus::Unnecessary);
    assert!(again.reply.is_none());
}

#[test_log::test(tokio::test)]
async fn delivery_gives_up_after_failure_limit() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session_with("alice", SessionConfig::default().with_failure_limit(3));
    fixture.notary.inject(Fault::InvalidReply, 3);

    let result = session
        .queue(Command::GetTransactionNumbers { count: 1 })
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::Error);
    assert_eq!(session.delivery_state(), DeliveryState::Idle);
    assert_eq!(session.last_status(), ReplyStatus::Error);
    assert!(session.issued().is_empty());
    assert_eq!(fixture.notary.requests().len(), 3);

    // the session is usable again
    let retry = session
        .queue(Command::GetTransactionNumbers { count: 1 })
        .unwrap()
        .await;
    assert_eq!(retry.status, ReplyStatus::ValidReply);
    assert_eq!(session.issued().len(), 1);
}

#[test_log::test(tokio::test)]
async fn lost_request_is_resent() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session("alice");
    fixture.notary.inject(Fault::Timeout, 1);

    let result = session.queue(Command::RegisterNym).unwrap().await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert!(session.is_registered());
    assert!(fixture.notary.is_registered(&alice()));
    assert_eq!(
        fixture.kinds(),
        vec![
            CommandKind::RegisterNym,
            CommandKind::GetNymbox,
            CommandKind::RegisterNym,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn dropped_reply_is_recovered_from_the_nymbox() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session("alice");
    fixture.notary.inject(Fault::DropReply, 1);

    let result = session
        .queue(Command::RegisterAccount { unit: "usd".into() })
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    let reply = result.reply.unwrap();
    assert_eq!(reply.request_number, 1);
    assert_eq!(
        reply.body,
        ReplyBody::RegisterAccount {
            account: Some(AccountId::from("usd-1"))
        }
    );

    // registered exactly once, on both sides
    let accounts = BTreeSet::from([AccountId::from("usd-1")]);
    assert_eq!(session.accounts(), accounts);
    assert_eq!(fixture.notary.accounts(&alice()), accounts);
    assert_eq!(fixture.notary.nymbox_len(&alice()), 0);
    assert!(
        !fixture
            .kinds()
            .iter()
            .skip(1)
            .any(|kind| *kind == CommandKind::RegisterAccount)
    );
}

#[test_log::test(tokio::test)]
async fn request_number_is_resynced_on_mismatch() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session("alice");
    fixture.notary.set_expected_request(&alice(), 10);

    let result = session.queue(Command::RegisterNym).unwrap().await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert_eq!(result.reply.map(|reply| reply.request_number), Some(10));
    assert!(session.is_registered());
    assert!(session.request_counter() >= 10);
    assert_eq!(
        fixture.kinds()[..3],
        [
            CommandKind::RegisterNym,
            CommandKind::GetRequestNumber,
            CommandKind::RegisterNym,
        ]
    );
}

#[test_log::test(tokio::test)]
async fn stale_nymbox_is_reconciled_before_resending() {
    let fixture = Fixture::new(
        FakeNotary::new("notary")
            .with_first_number(5)
            .with_fresh_nymbox_required(),
    );
    let session = with_numbers(&fixture).await;
    fixture.notary.push_receipt(
        &alice(),
        BoxReceipt::Notice {
            text: "maintenance".into(),
        },
    );

    let mut number = session.next_transaction_number(NumberPurpose::Transact).unwrap();
    let result = session
        .queue(notarize(number.value(), "transfer"))
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert!(result.reply.as_ref().is_some_and(|reply| reply.success));
    number.set_success(true);
    drop(number);

    assert_eq!(session.issued(), BTreeSet::from([6, 7]));
    assert_eq!(fixture.notary.issued(&alice()), BTreeSet::from([6, 7]));
    assert_eq!(fixture.notary.nymbox_len(&alice()), 0);
    assert!(fixture.workflow.events().contains(&WorkflowEvent::TransactionOutcome {
        number: 5,
        account: Some(AccountId::from("usd-1")),
        accepted: true,
    }));
}

#[test_log::test(tokio::test)]
async fn numbers_stay_out_while_a_stale_notarization_is_retried() {
    let fixture = Fixture::new(
        FakeNotary::new("notary")
            .with_first_number(5)
            .with_fresh_nymbox_required(),
    );
    let session = with_numbers(&fixture).await;
    fixture.notary.push_receipt(
        &alice(),
        BoxReceipt::Notice {
            text: "maintenance".into(),
        },
    );

    let mut number = session.next_transaction_number(NumberPurpose::Transact).unwrap();
    assert_eq!(number.value(), 5);
    let gate = fixture.notary.pause_box_receipts();
    let running = session.queue(notarize(5, "transfer")).unwrap();
    gate.entered.notified().await;

    // refused as stale, the payload is going to be resent with 5
    assert_eq!(session.available(), BTreeSet::from([6, 7]));
    let other = session.next_transaction_number(NumberPurpose::Transact).unwrap();
    assert_eq!(other.value(), 6);
    drop(other);

    gate.release.notify_one();
    let result = running.await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert!(result.reply.is_some_and(|reply| reply.success));
    number.set_success(true);
    drop(number);

    assert_eq!(session.issued(), BTreeSet::from([6, 7]));
    assert_eq!(session.available(), BTreeSet::from([6, 7]));
    assert_eq!(fixture.notary.issued(&alice()), BTreeSet::from([6, 7]));
}

#[test_log::test(tokio::test)]
async fn refused_foreign_numbers_are_not_adopted() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = with_numbers(&fixture).await;

    for number in [3, 999] {
        let result = session.queue(notarize(number, "transfer")).unwrap().await;
        assert_eq!(result.status, ReplyStatus::ValidReply);
        assert!(result.reply.is_some_and(|reply| !reply.success));
    }

    assert_eq!(session.issued(), BTreeSet::from([5, 6, 7]));
    assert_eq!(session.available(), BTreeSet::from([5, 6, 7]));
    assert_eq!(session.highest(), 7);
    assert!(fixture.workflow.events().is_empty());
}

#[test_log::test(tokio::test)]
async fn acknowledged_requests_do_not_pile_up() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = with_numbers(&fixture).await;

    for _ in 0..5 {
        session.queue(Command::RegisterNym).unwrap().await;
        fixture.notary.grant_numbers(&alice(), 1);
        let result = session.refresh_nymbox().unwrap().await;
        assert_eq!(result.status, ReplyStatus::ValidReply);
    }

    // only the last nymbox download, its box receipt and the accept remain
    let last = session.request_counter();
    assert_eq!(
        session.serialize().acknowledged_requests,
        BTreeSet::from([last - 2, last - 1, last])
    );
    assert_eq!(session.issued().len(), 8);
}

#[test_log::test(tokio::test)]
async fn rejected_transaction_burns_its_number() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = with_numbers(&fixture).await;

    let mut number = session.next_transaction_number(NumberPurpose::Transact).unwrap();
    let result = session
        .queue(notarize(number.value(), REJECTED_INSTRUMENT))
        .unwrap()
        .await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    number.set_success(true);
    drop(number);

    assert_eq!(session.issued(), BTreeSet::from([6, 7]));
    assert_eq!(
        fixture.workflow.events(),
        vec![WorkflowEvent::TransactionOutcome {
            number: 5,
            account: Some(AccountId::from("usd-1")),
            accepted: false,
        }]
    );
}

#[test_log::test(tokio::test)]
async fn second_delivery_is_refused_while_one_runs() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = fixture.session("alice");
    fixture.notary.grant_numbers(&alice(), 2);
    let gate = fixture.notary.pause_box_receipts();

    let running = session.refresh_nymbox().unwrap();
    gate.entered.notified().await;

    assert_eq!(session.delivery_state(), DeliveryState::NeedBoxItems);
    let before = session.serialize();
    assert_matches!(session.queue(Command::RegisterNym), Err(SessionError::Busy));
    assert_matches!(session.refresh_nymbox(), Err(SessionError::Busy));
    assert_eq!(session.serialize(), before);
    assert_eq!(session.delivery_state(), DeliveryState::NeedBoxItems);

    gate.release.notify_one();
    let result = running.await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert_eq!(session.issued(), BTreeSet::from([5, 6]));

    let next = session.queue(Command::RegisterNym).unwrap().await;
    assert_eq!(next.status, ReplyStatus::ValidReply);
}

#[test_log::test(tokio::test)]
async fn shutdown_resolves_running_delivery_as_not_sent() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session("alice");
    fixture.notary.grant_numbers(&alice(), 1);
    let gate = fixture.notary.pause_box_receipts();

    let running = session.refresh_nymbox().unwrap();
    gate.entered.notified().await;
    session.shutdown().await;

    let result = running.await;
    assert_eq!(result.status, ReplyStatus::NotSent);
    assert!(result.reply.is_none());
    assert_eq!(session.delivery_state(), DeliveryState::Idle);
    assert!(session.tentative().is_empty());
    assert_matches!(session.refresh_nymbox(), Err(SessionError::ShuttingDown));
}

#[test_log::test(tokio::test)]
async fn session_resumes_from_its_store() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let first = with_numbers(&fixture).await;
    let counter = first.request_counter();
    first.shutdown().await;

    let resumed = fixture.session("alice");
    assert_eq!(resumed.issued(), BTreeSet::from([5, 6, 7]));
    assert_eq!(resumed.highest(), 7);
    assert_eq!(resumed.request_counter(), counter);

    // the notary accepts the next request number without a resync
    let result = resumed.queue(Command::RegisterNym).unwrap().await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert_eq!(result.reply.map(|reply| reply.request_number), Some(counter + 1));
}

#[test_log::test(tokio::test)]
async fn unregistering_removes_the_record() {
    let fixture = Fixture::new(FakeNotary::new("notary").with_first_number(5));
    let session = with_numbers(&fixture).await;
    assert_eq!(fixture.store.len(), 1);

    let result = session.queue(Command::UnregisterNym).unwrap().await;
    assert_eq!(result.status, ReplyStatus::ValidReply);
    assert!(session.issued().is_empty());
    assert!(fixture.store.is_empty());
}

#[test_log::test(tokio::test)]
async fn messages_reach_the_recipient_workflow() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let alice = fixture.session("alice");
    let bob = fixture.session("bob");

    let sent = alice
        .queue(Command::SendNymMessage {
            recipient: NymId::from("bob"),
            payload: "lunch?".into(),
        })
        .unwrap()
        .await;
    assert_eq!(sent.status, ReplyStatus::ValidReply);

    let received = bob.refresh_nymbox().unwrap().await;
    assert_eq!(received.status, ReplyStatus::ValidReply);
    assert_matches!(
        fixture.workflow.events().as_slice(),
        [WorkflowEvent::IncomingMessage { sender, payload, .. }]
            if *sender == NymId::from("alice") && payload == "lunch?"
    );
    assert_eq!(fixture.notary.nymbox_len(&NymId::from("bob")), 0);
}

#[test_log::test(tokio::test)]
async fn transport_sees_every_exchange() {
    let fixture = Fixture::new(FakeNotary::new("notary"));
    let session = fixture.session("alice");
    session.queue(Command::RegisterNym).unwrap().await;

    let events = fixture.notary.events();
    assert_eq!(
        events.first(),
        Some(&TransportEvent::RequestSent {
            notary_id: NotaryId::from("notary"),
            request_number: 1,
            kind: CommandKind::RegisterNym,
        })
    );
    assert_eq!(
        events.get(1),
        Some(&TransportEvent::ReplyReceived {
            notary_id: NotaryId::from("notary"),
            request_number: 1,
            kind: CommandKind::RegisterNym,
            success: true,
        })
    );
    assert_eq!(events.len(), 2 * fixture.notary.requests().len());
}
