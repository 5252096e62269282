//! Typed, event-backed message ports
//!
//! A [`Protocol`] connects a producer side and a consumer side:
//!
//! ```text
//! producer ──send_out()──► [out queue] ──receive_out()──► consumer
//!          ◄─receive_in()─ [in queue]  ◄──send_in()────── consumer
//! ```
//!
//! Posting to a queue sets the queue's [`Event`], so a consumer serving
//! several ports can block on one shared event. A synchronous send blocks
//! the caller on a per-message reply channel; the consumer answers through
//! [`Replier::reply`] at most once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::PortError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("port mutex poisoned; continuing");
        e.into_inner()
    })
}

/// Auto-reset event: `set` wakes one waiter, which clears the flag.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.signaled) = true;
        self.cvar.notify_all();
    }

    /// Wait until set or `timeout` elapses. Returns whether the event was
    /// set; the flag is cleared either way.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.signaled);
        let (mut guard, _) = self
            .cvar
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, false)
    }

    pub fn reset(&self) {
        *lock(&self.signaled) = false;
    }
}

/// Single-use reply slot of a message.
pub struct Replier<I>(Option<SyncSender<I>>);

impl<I> Replier<I> {
    /// A replier for fire-and-forget messages; replies are discarded.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_sync(&self) -> bool {
        self.0.is_some()
    }

    /// Send the reply. Returns false when the sender stopped waiting or the
    /// message was posted asynchronously.
    pub fn reply(self, payload: I) -> bool {
        match self.0 {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

/// One queued message: the signal plus an optional reply slot.
pub struct Message<O, I> {
    pub signal: O,
    replier: Replier<I>,
}

impl<O, I> Message<O, I> {
    pub fn is_sync(&self) -> bool {
        self.replier.is_sync()
    }

    pub fn into_parts(self) -> (O, Replier<I>) {
        (self.signal, self.replier)
    }
}

type InlineHandler<O, I> = Box<dyn FnMut(O) -> Option<I> + Send>;

/// Bidirectional message port.
pub struct Protocol<O, I> {
    name: &'static str,
    out_queue: Mutex<VecDeque<Message<O, I>>>,
    in_queue: Mutex<VecDeque<I>>,
    out_event: Arc<Event>,
    in_event: Arc<Event>,
    deferred: AtomicBool,
    closed: AtomicBool,
    consumer: Mutex<Option<ThreadId>>,
    inline: Mutex<Option<InlineHandler<O, I>>>,
}

impl<O, I> Protocol<O, I> {
    /// `out_event` is set when the producer posts, `in_event` when the
    /// consumer answers through the in queue.
    pub fn new(name: &'static str, out_event: Arc<Event>, in_event: Arc<Event>) -> Self {
        Self {
            name,
            out_queue: Mutex::new(VecDeque::new()),
            in_queue: Mutex::new(VecDeque::new()),
            out_event,
            in_event,
            deferred: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumer: Mutex::new(None),
            inline: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn out_event(&self) -> &Arc<Event> {
        &self.out_event
    }

    pub fn in_event(&self) -> &Arc<Event> {
        &self.in_event
    }

    /// Record the calling thread as the consumer of the out queue.
    pub fn bind_consumer(&self) {
        *lock(&self.consumer) = Some(thread::current().id());
    }

    fn on_consumer_thread(&self) -> bool {
        *lock(&self.consumer) == Some(thread::current().id())
    }

    /// Handler used for synchronous sends issued from the consumer thread.
    pub fn set_inline_handler(&self, handler: impl FnMut(O) -> Option<I> + Send + 'static) {
        *lock(&self.inline) = Some(Box::new(handler));
    }

    fn push_out(&self, message: Message<O, I>) -> Result<(), Message<O, I>> {
        if self.is_closed() {
            return Err(message);
        }
        lock(&self.out_queue).push_back(message);
        self.out_event.set();
        Ok(())
    }

    /// Post without waiting for a reply.
    pub fn send_out(&self, signal: O) -> Result<(), PortError> {
        self.post(signal)
            .map_err(|_| PortError::Closed { port: self.name })
    }

    /// Like [`send_out`](Self::send_out), but hands the signal back when
    /// the port is closed so any buffers it carries can be recovered.
    pub fn post(&self, signal: O) -> Result<(), O> {
        self.push_out(Message {
            signal,
            replier: Replier::none(),
        })
        .map_err(|message| message.signal)
    }

    /// Post and block until the consumer replies or `timeout` elapses.
    ///
    /// Called from the consumer's own thread, the message is handed to the
    /// inline handler instead of being queued.
    pub fn send_out_sync(&self, signal: O, timeout: Duration) -> Result<I, PortError> {
        if self.on_consumer_thread() {
            let mut inline = lock(&self.inline);
            return match inline.as_mut() {
                Some(handler) => handler(signal).ok_or(PortError::NoReply { port: self.name }),
                None => Err(PortError::WouldDeadlock { port: self.name }),
            };
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.push_out(Message {
            signal,
            replier: Replier(Some(tx)),
        })
        .map_err(|_| PortError::Closed { port: self.name })?;
        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(PortError::Timeout {
                port: self.name,
                millis: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PortError::NoReply { port: self.name }),
        }
    }

    /// Next message for the consumer, unless the port is deferred.
    pub fn receive_out(&self) -> Option<Message<O, I>> {
        if self.is_deferred() {
            return None;
        }
        lock(&self.out_queue).pop_front()
    }

    pub fn has_out(&self) -> bool {
        !lock(&self.out_queue).is_empty()
    }

    /// Hold queued messages back from `receive_out` until undeferred.
    pub fn defer_out(&self, defer: bool) {
        self.deferred.store(defer, Ordering::Release);
        if !defer && self.has_out() {
            self.out_event.set();
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::Acquire)
    }

    /// Everything queued toward the consumer, regardless of deferral.
    pub fn drain_out(&self) -> Vec<Message<O, I>> {
        lock(&self.out_queue).drain(..).collect()
    }

    /// Answer asynchronously through the in queue.
    pub fn send_in(&self, payload: I) {
        lock(&self.in_queue).push_back(payload);
        self.in_event.set();
    }

    pub fn receive_in(&self) -> Option<I> {
        lock(&self.in_queue).pop_front()
    }

    /// Block up to `timeout` for an in-queue payload.
    pub fn wait_in(&self, timeout: Duration) -> Option<I> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.receive_in() {
                return Some(payload);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.in_event.wait(remaining) {
                return self.receive_in();
            }
        }
    }

    pub fn drain_in(&self) -> Vec<I> {
        lock(&self.in_queue).drain(..).collect()
    }

    /// Refuse further posts. Queued messages stay until drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.in_event.set();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> Arc<Protocol<u32, u32>> {
        Arc::new(Protocol::new(
            "test",
            Arc::new(Event::new()),
            Arc::new(Event::new()),
        ))
    }

    #[test]
    fn test_event_auto_resets() {
        let event = Event::new();
        event.set();
        assert!(event.wait(Duration::ZERO));
        assert!(!event.wait(Duration::ZERO));
    }

    #[test]
    fn test_fifo_order() {
        let port = port();
        for i in 0..5 {
            port.send_out(i).unwrap();
        }
        let received: Vec<u32> = std::iter::from_fn(|| port.receive_out())
            .map(|m| m.signal)
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_post_sets_out_event() {
        let port = port();
        port.send_out(7).unwrap();
        assert!(port.out_event().wait(Duration::ZERO));
    }

    #[test]
    fn test_deferred_port_holds_messages() {
        let port = port();
        port.defer_out(true);
        port.send_out(1).unwrap();
        assert!(port.receive_out().is_none());
        assert!(port.has_out());
        port.defer_out(false);
        assert_eq!(port.receive_out().map(|m| m.signal), Some(1));
    }

    #[test]
    fn test_sync_send_gets_reply() {
        let port = port();
        let consumer = Arc::clone(&port);
        let handle = thread::spawn(move || {
            consumer.bind_consumer();
            loop {
                if let Some(message) = consumer.receive_out() {
                    let (signal, replier) = message.into_parts();
                    replier.reply(signal * 2);
                    break;
                }
                consumer.out_event().wait(Duration::from_millis(10));
            }
        });
        let reply = port.send_out_sync(21, Duration::from_secs(5)).unwrap();
        assert_eq!(reply, 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_sync_send_times_out() {
        let port = port();
        let err = port
            .send_out_sync(1, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(
            err,
            PortError::Timeout {
                port: "test",
                millis: 20
            }
        );
    }

    #[test]
    fn test_dropped_message_reports_no_reply() {
        let port = port();
        let consumer = Arc::clone(&port);
        let handle = thread::spawn(move || {
            loop {
                if consumer.receive_out().is_some() {
                    break;
                }
                consumer.out_event().wait(Duration::from_millis(10));
            }
        });
        let err = port.send_out_sync(1, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, PortError::NoReply { port: "test" });
        handle.join().unwrap();
    }

    #[test]
    fn test_same_thread_sync_runs_inline() {
        let port = port();
        port.bind_consumer();
        assert_eq!(
            port.send_out_sync(1, Duration::from_secs(1)),
            Err(PortError::WouldDeadlock { port: "test" })
        );

        port.set_inline_handler(|signal| Some(signal + 100));
        assert_eq!(port.send_out_sync(1, Duration::from_secs(1)), Ok(101));
        // Nothing was queued
        assert!(!port.has_out());
    }

    #[test]
    fn test_closed_port_rejects_posts() {
        let port = port();
        port.close();
        assert_eq!(port.send_out(1), Err(PortError::Closed { port: "test" }));
        assert_eq!(port.post(5), Err(5));
    }

    #[test]
    fn test_wait_in() {
        let port = port();
        let producer = Arc::clone(&port);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.send_in(9);
        });
        assert_eq!(port.wait_in(Duration::from_secs(5)), Some(9));
        handle.join().unwrap();
        assert_eq!(port.wait_in(Duration::from_millis(5)), None);
    }
}
