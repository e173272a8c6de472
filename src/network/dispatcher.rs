//! Correlation of gateway replies with the commands waiting for them.
//!
//! The gateway has no universal correlation id. Commands that expect "the
//! next reply" share a single slot; outbound SMS sends are keyed by the id
//! the caller put into the command. Both kinds live in [`PendingCommands`],
//! which also owns every deadline, so a pending entry is removed exactly
//! once: by its reply, by its deadline, or by the session ending.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

use crate::core::{Error, GatewayEvent, InboundSms, Result, SmsStatusUpdate};
use crate::protocol::{MessageKind, ParsedMessage};

/// Longest deadline a pending command may carry
pub(crate) const MAX_DEADLINE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Completion handle of a pending command
pub(crate) type Reply = oneshot::Sender<Result<ParsedMessage>>;

/// How a command finds its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Correlation {
    /// Answered by the next command response
    NextResponse,
    /// Answered by the `UpdateSMS` event carrying this id
    MessageId(String),
}

struct Pending {
    command: &'static str,
    reply: Reply,
    deadline: delay_queue::Key,
}

/// Commands waiting for a reply
#[derive(Default)]
pub(crate) struct PendingCommands {
    next_response: Option<Pending>,
    by_id: HashMap<String, Pending>,
    deadlines: DelayQueue<Correlation>,
}

impl PendingCommands {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a command; on conflict or an unusable timeout the reply is
    /// failed and false returned
    pub(crate) fn register(
        &mut self,
        correlation: Correlation,
        command: &'static str,
        timeout: Duration,
        reply: Reply,
    ) -> bool {
        if timeout > MAX_DEADLINE {
            let _ = reply.send(Err(Error::invalid_argument(format!(
                "{} timeout of {:?} exceeds {:?}",
                command, timeout, MAX_DEADLINE
            ))));
            return false;
        }
        let conflict = match &correlation {
            Correlation::NextResponse => self.next_response.is_some(),
            Correlation::MessageId(id) => self.by_id.contains_key(id),
        };
        if conflict {
            let _ = reply.send(Err(Error::invalid_state(format!(
                "a {} command with the same correlation is already pending",
                command
            ))));
            return false;
        }

        let deadline = self.deadlines.insert(correlation.clone(), timeout);
        let pending = Pending {
            command,
            reply,
            deadline,
        };
        match correlation {
            Correlation::NextResponse => self.next_response = Some(pending),
            Correlation::MessageId(id) => {
                self.by_id.insert(id, pending);
            }
        }
        true
    }

    fn take(&mut self, correlation: &Correlation) -> Option<Pending> {
        match correlation {
            Correlation::NextResponse => self.next_response.take(),
            Correlation::MessageId(id) => self.by_id.remove(id),
        }
    }

    /// Completes a pending command; false when nothing was waiting
    pub(crate) fn resolve(&mut self, correlation: &Correlation, outcome: Result<ParsedMessage>) -> bool {
        match self.take(correlation) {
            Some(pending) => {
                self.deadlines.remove(&pending.deadline);
                let _ = pending.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fails a command whose deadline fired
    pub(crate) fn expire(&mut self, correlation: Correlation) {
        // The queue already dropped this deadline
        if let Some(pending) = self.take(&correlation) {
            debug!(command = pending.command, ?correlation, "Command timed out");
            let _ = pending.reply.send(Err(Error::timeout(format!(
                "no reply to {} command",
                pending.command
            ))));
        }
    }

    /// Waits for the next deadline; only call while something is pending
    pub(crate) async fn next_expired(&mut self) -> Option<Correlation> {
        poll_fn(|cx| self.deadlines.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    /// Fails every pending command
    pub(crate) fn fail_all(&mut self, reason: impl Fn() -> Error) {
        let slot = self.next_response.take();
        for pending in slot.into_iter().chain(self.by_id.drain().map(|(_, p)| p)) {
            let _ = pending.reply.send(Err(reason()));
        }
        self.deadlines.clear();
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(self.next_response.is_some()) + self.by_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, correlation: &Correlation) -> bool {
        match correlation {
            Correlation::NextResponse => self.next_response.is_some(),
            Correlation::MessageId(id) => self.by_id.contains_key(id),
        }
    }
}

/// Routes parsed messages to pending commands and event subscribers
pub(crate) struct Dispatcher {
    pending: PendingCommands,
    events: broadcast::Sender<GatewayEvent>,
}

impl Dispatcher {
    pub(crate) fn new(events: broadcast::Sender<GatewayEvent>) -> Self {
        Dispatcher {
            pending: PendingCommands::new(),
            events,
        }
    }

    pub(crate) fn pending(&mut self) -> &mut PendingCommands {
        &mut self.pending
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Publishes an event; having no subscribers is fine
    pub(crate) fn publish(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    /// Handles one message received on an authenticated session
    pub(crate) fn route(&mut self, message: ParsedMessage) {
        match message.kind() {
            // After login these are ordinary replies to the pending command
            MessageKind::AuthSuccess | MessageKind::AuthFailure | MessageKind::CommandResponse => {
                if !self.pending.resolve(&Correlation::NextResponse, Ok(message)) {
                    debug!("Dropping command response with no pending command");
                }
            }
            MessageKind::SmsEvent => match InboundSms::try_from(&message) {
                Ok(sms) => {
                    trace!(id = %sms.id, port = %sms.port, "SMS received");
                    self.publish(GatewayEvent::SmsReceived(sms));
                }
                Err(e) => warn!(error = %e, "Dropping malformed ReceivedSMS event"),
            },
            MessageKind::SmsStatusEvent => match SmsStatusUpdate::try_from(&message) {
                Ok(update) => {
                    let key = Correlation::MessageId(update.id.clone());
                    if !self.pending.resolve(&key, Ok(message)) {
                        debug!(id = %update.id, "SMS status with no pending send");
                    }
                    self.publish(GatewayEvent::SmsStatusUpdate(update));
                }
                Err(e) => warn!(error = %e, "Dropping malformed UpdateSMS event"),
            },
            MessageKind::Unrecognized => {
                debug!(lines = ?message.lines(), "Dropping unrecognized message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn frame(text: &str) -> ParsedMessage {
        ParsedMessage::parse(text.as_bytes())
    }

    fn dispatcher() -> (Dispatcher, broadcast::Receiver<GatewayEvent>) {
        let (events, rx) = broadcast::channel(16);
        (Dispatcher::new(events), rx)
    }

    #[tokio::test]
    async fn test_success_reply_resolves_pending_command() {
        let (mut dispatcher, _events) = dispatcher();
        let (tx, rx) = oneshot::channel();
        dispatcher
            .pending()
            .register(Correlation::NextResponse, "show spans", Duration::from_secs(10), tx);

        dispatcher.route(frame("Response: Success\r\nMessage: done\r\n\r\n"));

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.kind(), MessageKind::AuthSuccess);
        assert!(!dispatcher.has_pending());
    }

    #[tokio::test]
    async fn test_keyed_reply_leaves_others_pending() {
        let (mut dispatcher, mut events) = dispatcher();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        let (tx_c, mut rx_c) = oneshot::channel();
        let timeout = Duration::from_secs(30);
        let pending = dispatcher.pending();
        pending.register(Correlation::MessageId("a".into()), "send sms", timeout, tx_a);
        pending.register(Correlation::MessageId("b".into()), "send sms", timeout, tx_b);
        pending.register(Correlation::NextResponse, "show spans", Duration::from_secs(10), tx_c);

        dispatcher.route(frame("Event: UpdateSMS\r\nID: a\r\nStatus: 1\r\n\r\n"));

        let reply = rx_a.await.unwrap().unwrap();
        assert_eq!(reply.field("ID"), Some("a"));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());

        let pending = dispatcher.pending();
        assert!(!pending.contains(&Correlation::MessageId("a".into())));
        assert!(pending.contains(&Correlation::MessageId("b".into())));
        assert!(pending.contains(&Correlation::NextResponse));
        assert_eq!(pending.len(), 2);

        match events.try_recv().unwrap() {
            GatewayEvent::SmsStatusUpdate(update) => assert!(update.is_sent()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut pending = PendingCommands::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let key = Correlation::MessageId("dup".into());

        assert!(pending.register(key.clone(), "send sms", Duration::from_secs(30), tx1));
        assert!(!pending.register(key.clone(), "send sms", Duration::from_secs(30), tx2));

        assert!(matches!(rx2.await.unwrap(), Err(Error::InvalidState(_))));
        assert!(rx1.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_deadline_rejected() {
        let mut pending = PendingCommands::new();
        let (tx, rx) = oneshot::channel();

        let year = Duration::from_secs(100_000_000);
        assert!(!pending.register(Correlation::NextResponse, "send ussd", year, tx));

        assert!(matches!(rx.await.unwrap(), Err(Error::InvalidArgument(_))));
        assert!(pending.is_empty());

        let (tx, _rx) = oneshot::channel();
        assert!(pending.register(Correlation::NextResponse, "send ussd", MAX_DEADLINE, tx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_entry_and_ignores_late_reply() {
        let (mut dispatcher, _events) = dispatcher();
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        dispatcher.pending().register(
            Correlation::MessageId("late".into()),
            "send sms",
            Duration::from_secs(30),
            tx,
        );

        let expired = dispatcher.pending().next_expired().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        dispatcher.pending().expire(expired);

        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout(_))));
        assert!(!dispatcher.has_pending());

        // A late status for the same id has nothing left to resolve
        dispatcher.route(frame("Event: UpdateSMS\r\nID: late\r\nStatus: 1\r\n\r\n"));
        assert!(!dispatcher.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_command_never_expires() {
        let mut pending = PendingCommands::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.register(Correlation::NextResponse, "show spans", Duration::from_secs(10), tx1);
        pending.register(
            Correlation::MessageId("x".into()),
            "send sms",
            Duration::from_secs(30),
            tx2,
        );

        assert!(pending.resolve(&Correlation::NextResponse, Ok(frame("Response: Follows\r\n\r\n"))));
        assert!(rx1.await.unwrap().is_ok());

        // Only the keyed deadline is left in the queue
        let expired = pending.next_expired().await.unwrap();
        assert_eq!(expired, Correlation::MessageId("x".into()));
        pending.expire(expired);
        assert!(rx2.await.unwrap().is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_uncorrelated_response_is_dropped() {
        let (mut dispatcher, mut events) = dispatcher();
        dispatcher.route(frame("Response: Follows\r\n--END COMMAND--\r\n\r\n"));
        dispatcher.route(frame("Event: Hangup\r\n\r\n"));
        assert!(!dispatcher.has_pending());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sms_event_published() {
        let (mut dispatcher, mut events) = dispatcher();
        dispatcher.route(frame(
            "Event: ReceivedSMS\r\nID: 5\r\nGsmSpan: 3\r\nSender: 100\r\nContent: Hi%21\r\n\r\n",
        ));
        dispatcher.route(frame("Event: ReceivedSMS\r\nID: 6\r\nGsmSpan: 12\r\n\r\n"));

        match events.try_recv().unwrap() {
            GatewayEvent::SmsReceived(sms) => {
                assert_eq!(sms.port.number(), 2);
                assert_eq!(sms.content, "Hi!");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_all_drains_everything() {
        let mut pending = PendingCommands::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.register(Correlation::NextResponse, "show spans", Duration::from_secs(10), tx1);
        pending.register(Correlation::MessageId("m".into()), "send sms", Duration::from_secs(30), tx2);

        pending.fail_all(|| Error::transport("connection lost"));

        assert!(matches!(rx1.await.unwrap(), Err(Error::Transport(_))));
        assert!(matches!(rx2.await.unwrap(), Err(Error::Transport(_))));
        assert!(pending.is_empty());
    }
}
