//! Single-reader buffering message endpoints.
//!
//! A [`Port`] is where messages enter the system. With a receiver attached
//! and the port unpaused, a post hands the message straight to the receiver;
//! otherwise the message is buffered. Flushing unpauses the port and replays
//! the pending message plus everything queued, in FIFO order, through the
//! normal post path — which may buffer some of them again if the receiver
//! still pushes back.
//!
//! The port mutex guards only its own state; it is never held while the
//! receiver or any user code runs.

use crate::receiver::{DeliveryStatus, Receiver};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct PortState<T> {
    receiver: Option<Arc<Receiver<T>>>,
    /// A message the receiver declined; replayed first on flush.
    pending: Option<T>,
    /// Overflow buffer, allocated on first use.
    queue: Option<VecDeque<T>>,
    paused: bool,
}

/// A queueing endpoint delivering to at most one receiver.
pub struct Port<T> {
    state: Mutex<PortState<T>>,
}

impl<T: Send + 'static> Default for Port<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Port<T> {
    /// Create a port with no receiver; posts buffer until one is attached.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortState {
                receiver: None,
                pending: None,
                queue: None,
                paused: false,
            }),
        }
    }

    /// Whether a receiver is currently attached.
    pub fn has_receiver(&self) -> bool {
        self.state.lock().unwrap().receiver.is_some()
    }

    /// Messages buffered and not yet delivered (pending cell included).
    pub fn queue_len(&self) -> usize {
        let state = self.state.lock().unwrap();
        let queued = state.queue.as_ref().map_or(0, VecDeque::len);
        queued + usize::from(state.pending.is_some())
    }

    /// Whether deliveries are parked: paused, or holding buffered messages.
    pub fn is_parked(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.paused
            || state.pending.is_some()
            || state.queue.as_ref().is_some_and(|q| !q.is_empty())
    }

    /// Post a message.
    ///
    /// Never blocks on user code: either the message is buffered under the
    /// port mutex, or it is handed to the receiver after the mutex is
    /// released.
    pub fn post(&self, message: T) {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.paused || state.receiver.is_none() || state.pending.is_some() {
                state
                    .queue
                    .get_or_insert_with(VecDeque::new)
                    .push_back(message);
                return;
            }
            Arc::clone(state.receiver.as_ref().expect("checked above"))
        };

        match receiver.deliver(message) {
            DeliveryStatus::Accepted => {}
            DeliveryStatus::AcceptedPause => {
                self.state.lock().unwrap().paused = true;
            }
            DeliveryStatus::Pause(message) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.paused = true;
                    state.pending = Some(message);
                }
                // The receiver may have gone idle between its decision and
                // our buffering; re-offer rather than strand the message.
                if receiver.is_idle() {
                    self.flush();
                }
            }
            DeliveryStatus::AcceptedRemove => {
                self.detach_if_current(&receiver);
            }
            DeliveryStatus::Remove(message) => {
                self.state.lock().unwrap().pending = Some(message);
                self.detach_if_current(&receiver);
            }
        }
    }

    /// Unpause and replay all buffered messages through the normal post
    /// path, preserving FIFO order.
    pub fn flush(&self) {
        let (pending, queue) = {
            let mut state = self.state.lock().unwrap();
            state.paused = false;
            (state.pending.take(), state.queue.take())
        };

        if let Some(message) = pending {
            self.post(message);
        }
        if let Some(queue) = queue {
            for message in queue {
                self.post(message);
            }
        }
    }

    /// Attach (or detach, with `None`) the receiver.
    ///
    /// A newly attached receiver immediately receives everything buffered.
    /// Re-setting the same receiver is a no-op. The old receiver is simply
    /// no longer referenced from this port — it gets no notification.
    pub fn set_receiver(self: &Arc<Self>, receiver: Option<Arc<Receiver<T>>>) {
        {
            let mut state = self.state.lock().unwrap();
            let same = match (&state.receiver, &receiver) {
                (Some(old), Some(new)) => Arc::ptr_eq(old, new),
                (None, None) => true,
                _ => false,
            };
            if same {
                return;
            }
            state.receiver = receiver.clone();
        }

        if let Some(receiver) = receiver {
            receiver.bind_port(Arc::downgrade(self));
            self.flush();
        }
    }

    fn detach_if_current(&self, receiver: &Arc<Receiver<T>>) {
        let mut state = self.state.lock().unwrap();
        if state
            .receiver
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, receiver))
        {
            state.receiver = None;
        }
    }
}

impl<T> std::fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Port")
            .field("has_receiver", &state.receiver.is_some())
            .field("paused", &state.paused)
            .field("pending", &state.pending.is_some())
            .field("queued", &state.queue.as_ref().map_or(0, VecDeque::len))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
