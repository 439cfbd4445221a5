//! Per-thread message queues.
//!
//! Every kernel thread owns a queue of [`Message`]s. The owning thread
//! services its queue while blocked in [`wait_handles`](crate::wait::wait_handles),
//! one message per wake, and otherwise drains it with [`get_message`] and
//! [`dispatch_message`]. Other threads post through a [`MessagePoster`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::host::{wait_any, HostWait, WaitBlock};
use crate::per_thread::{self, ThreadId};
use crate::tracing_compat::trace;
use crate::wait::WaitMillis;

/// A message delivered to a thread's queue.
pub enum Message {
    /// Request for the thread's message loop to end with this exit code.
    Quit(i32),
    /// A closure to run on the receiving thread.
    Call(Box<dyn FnOnce() + Send>),
    /// An application-defined message, passed to the thread's handler.
    User {
        /// Application-defined message id.
        id: u32,
        /// Application-defined payload.
        param: u64,
    },
}

impl Message {
    /// Wraps a closure as a [`Message::Call`].
    pub fn call(f: impl FnOnce() + Send + 'static) -> Self {
        Self::Call(Box::new(f))
    }

    /// Returns true for [`Message::Quit`].
    #[must_use]
    pub const fn is_quit(&self) -> bool {
        matches!(self, Self::Quit(_))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quit(code) => f.debug_tuple("Quit").field(code).finish(),
            Self::Call(_) => f.write_str("Call(..)"),
            Self::User { id, param } => f
                .debug_struct("User")
                .field("id", id)
                .field("param", param)
                .finish(),
        }
    }
}

/// A thread's message queue.
///
/// At most one wait block is registered at a time: only the queue's own
/// thread waits on it.
pub(crate) struct MessageQueue {
    messages: SegQueue<Message>,
    waiter: Mutex<Option<Arc<WaitBlock>>>,
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("pending", &self.messages.len())
            .finish_non_exhaustive()
    }
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            messages: SegQueue::new(),
            waiter: Mutex::new(None),
        }
    }

    /// Appends a message and wakes the registered waiter, if any.
    pub(crate) fn push(&self, message: Message) {
        self.messages.push(message);
        if let Some(block) = self.waiter.lock().as_ref() {
            block.try_wake_for_message();
        }
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        self.messages.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    /// Registers `block` to be woken by the next post. Wakes it at once if
    /// a message is already pending.
    pub(crate) fn register_waiter(&self, block: &Arc<WaitBlock>) {
        let mut waiter = self.waiter.lock();
        *waiter = Some(Arc::clone(block));
        if !self.messages.is_empty() {
            block.try_wake_for_message();
        }
    }

    pub(crate) fn unregister_waiter(&self, block: &Arc<WaitBlock>) {
        let mut waiter = self.waiter.lock();
        if waiter.as_ref().is_some_and(|current| Arc::ptr_eq(current, block)) {
            *waiter = None;
        }
    }
}

/// Posts messages to one thread's queue. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct MessagePoster {
    tid: ThreadId,
    queue: Arc<MessageQueue>,
}

impl fmt::Debug for MessagePoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePoster")
            .field("tid", &self.tid)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl MessagePoster {
    pub(crate) fn new(tid: ThreadId, queue: Arc<MessageQueue>) -> Self {
        Self { tid, queue }
    }

    /// Returns a poster for the calling thread's own queue.
    #[must_use]
    pub fn current() -> Self {
        Self::new(per_thread::tid_caller(), per_thread::current_queue())
    }

    /// The id of the thread this poster delivers to.
    #[must_use]
    pub const fn target(&self) -> ThreadId {
        self.tid
    }

    /// Posts `message` to the target thread.
    pub fn post(&self, message: Message) {
        trace!(target_tid = %self.tid, message = ?message, "posting message");
        self.queue.push(message);
    }

    /// Posts a [`Message::Quit`] to the target thread.
    pub fn post_quit(&self, exit_code: i32) {
        self.post(Message::Quit(exit_code));
    }

    /// Number of messages not yet retrieved by the target thread.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

type Handler = Box<dyn FnMut(u32, u64)>;

thread_local! {
    static HANDLER: RefCell<Option<Handler>> = const { RefCell::new(None) };
}

/// Posts `message` to the calling thread's own queue.
pub fn post_message(message: Message) {
    per_thread::current_queue().push(message);
}

/// Posts a [`Message::Quit`] to the calling thread's own queue.
pub fn post_quit_message(exit_code: i32) {
    post_message(Message::Quit(exit_code));
}

/// Removes and returns the next pending message without blocking.
#[must_use]
pub fn peek_message() -> Option<Message> {
    per_thread::current_queue().pop()
}

/// Returns the number of messages pending on the calling thread's queue.
#[must_use]
pub fn pending_messages() -> usize {
    per_thread::current_queue().len()
}

/// Waits up to `timeout` for the next message on the calling thread's
/// queue. Returns `None` if none arrived in time.
#[must_use]
pub fn get_message(timeout: WaitMillis) -> Option<Message> {
    let queue = per_thread::current_queue();
    let caller = per_thread::tid_caller();
    let deadline = timeout
        .as_duration()
        .and_then(|budget| Instant::now().checked_add(budget));
    loop {
        if let Some(message) = queue.pop() {
            return Some(message);
        }
        let budget = match deadline {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None if timeout.is_infinite() => None,
            None => Some(std::time::Duration::MAX),
        };
        match wait_any(&[], budget, Some(&queue), caller) {
            HostWait::Message | HostWait::Object(_) => {}
            HostWait::Timeout => return queue.pop(),
        }
    }
}

/// Installs the calling thread's handler for [`Message::User`] messages,
/// replacing any previous one.
pub fn set_message_handler(handler: impl FnMut(u32, u64) + 'static) {
    HANDLER.with(|slot| *slot.borrow_mut() = Some(Box::new(handler)));
}

/// Removes the calling thread's user-message handler.
pub fn clear_message_handler() {
    HANDLER.with(|slot| *slot.borrow_mut() = None);
}

/// Processes one message on the calling thread.
///
/// Calls are run, user messages go to the thread's handler (and are
/// dropped without one), and quit messages are ignored.
pub fn dispatch_message(message: Message) {
    match message {
        Message::Call(f) => f(),
        Message::User { id, param } => {
            // Taken out for the call so the handler may dispatch re-entrantly.
            let handler = HANDLER.with(|slot| slot.borrow_mut().take());
            let Some(mut handler) = handler else {
                trace!(id, param, "user message dropped: no handler");
                return;
            };
            handler(id, param);
            HANDLER.with(|slot| {
                let mut slot = slot.borrow_mut();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            });
        }
        Message::Quit(code) => {
            trace!(code, "quit message dispatched; ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn post_and_peek_are_fifo() {
        std::thread::spawn(|| {
            post_message(Message::User { id: 1, param: 10 });
            post_quit_message(3);
            assert_eq!(pending_messages(), 2);
            assert!(matches!(peek_message(), Some(Message::User { id: 1, param: 10 })));
            assert!(matches!(peek_message(), Some(Message::Quit(3))));
            assert!(peek_message().is_none());
        })
        .join()
        .expect("join");
    }

    #[test]
    fn get_message_times_out_on_empty_queue() {
        std::thread::spawn(|| {
            let start = Instant::now();
            assert!(get_message(WaitMillis::from_millis(20)).is_none());
            assert!(start.elapsed() >= Duration::from_millis(15));
            assert!(get_message(WaitMillis::ZERO).is_none());
        })
        .join()
        .expect("join");
    }

    #[test]
    fn poster_wakes_blocked_receiver() {
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = std::thread::spawn(move || {
            tx.send(MessagePoster::current()).expect("send poster");
            get_message(WaitMillis::INFINITE)
        });
        let poster = rx.recv().expect("poster");
        std::thread::sleep(Duration::from_millis(10));
        poster.post(Message::User { id: 9, param: 0 });
        let received = receiver.join().expect("join");
        assert!(matches!(received, Some(Message::User { id: 9, .. })));
    }

    #[test]
    fn dispatch_runs_calls_and_handler() {
        std::thread::spawn(|| {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran);
            dispatch_message(Message::call(move || flag.store(true, Ordering::SeqCst)));
            assert!(ran.load(Ordering::SeqCst));

            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&seen);
            set_message_handler(move |id, param| sink.borrow_mut().push((id, param)));
            dispatch_message(Message::User { id: 4, param: 40 });
            dispatch_message(Message::User { id: 5, param: 50 });
            assert_eq!(*seen.borrow(), vec![(4, 40), (5, 50)]);

            clear_message_handler();
            dispatch_message(Message::User { id: 6, param: 60 });
            assert_eq!(seen.borrow().len(), 2);
        })
        .join()
        .expect("join");
    }

    #[test]
    fn message_debug_hides_closure() {
        assert_eq!(format!("{:?}", Message::call(|| {})), "Call(..)");
        assert_eq!(format!("{:?}", Message::Quit(1)), "Quit(1)");
    }
}
