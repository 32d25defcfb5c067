//! Control-plane event bus.
//!
//! Synchronous, in-process publish/subscribe. Publishing walks the
//! subscriber list in subscription order and calls every callback whose
//! type filter matches, on the calling (reactor) thread, before returning.
//! Events published from inside a callback are delivered depth-first.
//!
//! There is no replay and no queueing. Subscribers must not block, and by
//! policy must not republish the event they are handling for the same
//! object (the bus does not detect loops).

use grout_core::log_debug;

use crate::Control;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    IfaceAdded,
    IfaceReconfigured,
    IfaceDeleted,
    IfaceStatusUp,
    IfaceStatusDown,
    IfaceAddressAdded,
    IfaceAddressRemoved,
}

#[derive(Debug, Clone, Copy)]
pub enum EventPayload {
    None,
    /// An interface id; still resolvable for every event except the tail
    /// end of `IfaceDeleted` delivery.
    Iface(u16),
}

pub type EventCallback = fn(&mut Control, EventType, &EventPayload);

#[derive(Clone, Copy)]
pub struct EventSubscription {
    pub callback: EventCallback,
    pub ev_types: &'static [EventType],
}

pub fn subscribe(ctl: &mut Control, sub: EventSubscription) {
    ctl.subscriptions.push(sub);
}

pub fn publish(ctl: &mut Control, ev_type: EventType, payload: &EventPayload) {
    log_debug!("event {:?} {:?}", ev_type, payload);
    // Snapshot so callbacks may publish (or subscribe) re-entrantly.
    let subs = ctl.subscriptions.clone();
    for sub in subs {
        if sub.ev_types.contains(&ev_type) {
            (sub.callback)(ctl, ev_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;

    // One recorder per test: the harness runs tests concurrently.
    static ORDER_SEEN: Mutex<Vec<(&'static str, u16)>> = Mutex::new(Vec::new());
    static DEPTH_SEEN: Mutex<Vec<(&'static str, u16)>> = Mutex::new(Vec::new());
    static REPLAY_SEEN: Mutex<Vec<(&'static str, u16)>> = Mutex::new(Vec::new());

    fn payload_id(payload: &EventPayload) -> u16 {
        match payload {
            EventPayload::Iface(id) => *id,
            EventPayload::None => 0,
        }
    }

    fn order_first(_: &mut Control, _: EventType, payload: &EventPayload) {
        ORDER_SEEN.lock().unwrap().push(("first", payload_id(payload)));
    }

    fn order_second(_: &mut Control, _: EventType, payload: &EventPayload) {
        ORDER_SEEN.lock().unwrap().push(("second", payload_id(payload)));
    }

    fn depth_chained(ctl: &mut Control, ev: EventType, _: &EventPayload) {
        // re-publish a *different* event from inside delivery
        if ev == EventType::IfaceStatusUp {
            publish(ctl, EventType::IfaceStatusDown, &EventPayload::Iface(9));
        }
        DEPTH_SEEN.lock().unwrap().push(("chained", 0));
    }

    fn depth_second(_: &mut Control, _: EventType, payload: &EventPayload) {
        DEPTH_SEEN.lock().unwrap().push(("second", payload_id(payload)));
    }

    fn replay_first(_: &mut Control, _: EventType, payload: &EventPayload) {
        REPLAY_SEEN.lock().unwrap().push(("first", payload_id(payload)));
    }

    const UP_ONLY: &[EventType] = &[EventType::IfaceStatusUp];
    const UP_DOWN: &[EventType] = &[EventType::IfaceStatusUp, EventType::IfaceStatusDown];

    #[test]
    fn test_delivery_order_and_filter() {
        let mut ctl = Control::new(Config::default());
        subscribe(&mut ctl, EventSubscription { callback: order_first, ev_types: UP_ONLY });
        subscribe(&mut ctl, EventSubscription { callback: order_second, ev_types: UP_DOWN });

        publish(&mut ctl, EventType::IfaceStatusUp, &EventPayload::Iface(3));
        publish(&mut ctl, EventType::IfaceStatusDown, &EventPayload::Iface(4));

        let seen = ORDER_SEEN.lock().unwrap().clone();
        assert_eq!(seen, vec![("first", 3), ("second", 3), ("second", 4)]);
    }

    #[test]
    fn test_depth_first_republish() {
        let mut ctl = Control::new(Config::default());
        subscribe(&mut ctl, EventSubscription { callback: depth_chained, ev_types: UP_ONLY });
        subscribe(&mut ctl, EventSubscription { callback: depth_second, ev_types: UP_DOWN });

        publish(&mut ctl, EventType::IfaceStatusUp, &EventPayload::Iface(1));

        // the nested IfaceStatusDown is fully delivered before "chained"
        // returns and before "second" sees the outer IfaceStatusUp
        let seen = DEPTH_SEEN.lock().unwrap().clone();
        assert_eq!(seen, vec![("second", 9), ("chained", 0), ("second", 1)]);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let mut ctl = Control::new(Config::default());
        publish(&mut ctl, EventType::IfaceStatusUp, &EventPayload::Iface(5));
        subscribe(&mut ctl, EventSubscription { callback: replay_first, ev_types: UP_ONLY });
        assert!(REPLAY_SEEN.lock().unwrap().is_empty());
    }
}
