//! Polling seam between callback-driven collaborators (web server, OTA) and
//! the cooperative loop.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use thiserror::Error;

use crate::web::WebCommand;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("Auth Failed")]
    Auth,
    #[error("Begin Failed")]
    Begin,
    #[error("Connect Failed")]
    Connect,
    #[error("Receive Failed")]
    Receive,
    #[error("End Failed")]
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    Started,
    Progress { written: usize, total: usize },
    Finished,
    Failed(OtaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Web(WebCommand),
    Ota(OtaEvent),
}

pub trait EventSource {
    /// Everything queued since the last call. Never blocks.
    fn pending_events(&mut self) -> Vec<DeviceEvent>;
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<DeviceEvent>,
}

impl EventSender {
    /// Returns false once the loop side has gone away.
    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn web(&self, command: WebCommand) -> bool {
        self.send(DeviceEvent::Web(command))
    }

    pub fn ota(&self, event: OtaEvent) -> bool {
        self.send(DeviceEvent::Ota(event))
    }
}

#[derive(Debug)]
pub struct EventQueue {
    rx: Receiver<DeviceEvent>,
}

impl EventSource for EventQueue {
    fn pending_events(&mut self) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        events
    }
}

pub fn event_channel() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, EventQueue { rx })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn drains_in_arrival_order_without_blocking() {
        let (sender, mut queue) = event_channel();
        assert!(queue.pending_events().is_empty());

        sender.web(WebCommand::Activity);
        sender.ota(OtaEvent::Started);
        sender.web(WebCommand::Reboot);

        assert_eq!(
            queue.pending_events(),
            vec![
                DeviceEvent::Web(WebCommand::Activity),
                DeviceEvent::Ota(OtaEvent::Started),
                DeviceEvent::Web(WebCommand::Reboot),
            ]
        );
        assert!(queue.pending_events().is_empty());
    }

    #[test]
    fn sender_notices_dropped_queue() {
        let (sender, queue) = event_channel();
        drop(queue);
        assert!(!sender.ota(OtaEvent::Finished));
    }
}
