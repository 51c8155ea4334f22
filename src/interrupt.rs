//! Edge interrupt dispatch for GPIO input lines
//!
//! Each pin with registered callbacks gets one background thread blocked in
//! `poll(2)` on two descriptors: the pin's value source and a private wake
//! socket. An edge makes the value source ready and every callback is run
//! with the value read at that moment. `cancel` raises the stop flag, pokes
//! the wake socket and joins the thread.
//!
//! Delivery is one value per wake-up. Edges that happen while callbacks are
//! still running collapse into whatever the line reads at the next wake-up.

use crate::error::{GpioError, Result};
use crate::pin::{Direction, EdgeSource, PinDevice};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Write};
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Called with the pin's value (e.g. `"1"`) after each edge.
pub type Callback = Arc<dyn Fn(&str) + Send + Sync + 'static>;

type CallbackList = Arc<Mutex<Vec<Callback>>>;

/// A running wait loop for one pin.
struct Waiter {
    stop: Arc<AtomicBool>,
    wake: UnixStream,
    thread: JoinHandle<Result<()>>,
}

impl Waiter {
    fn spawn<P: PinDevice + ?Sized>(pin: &P, callbacks: CallbackList) -> Result<Self> {
        let source = pin.open_edge_source()?;
        let (wake_rx, wake) = UnixStream::pair().map_err(GpioError::io("creating wake channel"))?;
        let stop = Arc::new(AtomicBool::new(false));

        let name = pin.name().to_string();
        let loop_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("irq-{}", name))
            .spawn(move || wait_loop(name, source, wake_rx, loop_stop, callbacks))
            .map_err(GpioError::io("spawning interrupt thread"))?;

        Ok(Waiter { stop, wake, thread })
    }

    fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    fn is_current_thread(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    /// Stop the loop and wait for it. Returns the loop's own error, if it
    /// died before being asked to stop.
    fn stop_and_join(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.wake.write_all(&[1]) {
            // Loop already gone and took the other end with it.
            debug!("Wake channel closed: {}", e);
        }
        self.join()
    }

    fn join(self) -> Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(GpioError::io("joining interrupt thread")(io::Error::new(
                io::ErrorKind::Other,
                "interrupt thread panicked",
            ))),
        }
    }
}

struct Registration {
    name: String,
    callbacks: CallbackList,
    waiter: Waiter,
}

/// Owns the interrupt registrations for any number of pins.
///
/// Independent dispatchers do not share state. Dropping a dispatcher cancels
/// everything it started.
#[derive(Default)]
pub struct InterruptDispatcher {
    registrations: Mutex<HashMap<u32, Registration>>,
}

impl InterruptDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` to the pin's list, starting its wait loop if none is
    /// running. The pin must be configured as an input.
    pub fn register_callback<P, F>(&self, pin: &P, callback: F) -> Result<()>
    where
        P: PinDevice + ?Sized,
        F: Fn(&str) + Send + Sync + 'static,
    {
        if pin.direction()? != Direction::Input {
            return Err(GpioError::Precondition(format!(
                "pin {} must be an input to register interrupts",
                pin.name()
            )));
        }

        let callback: Callback = Arc::new(callback);
        let mut registrations = self.registrations.lock();

        match registrations.entry(pin.number()) {
            Entry::Vacant(entry) => {
                let callbacks: CallbackList = Arc::new(Mutex::new(vec![callback]));
                let waiter = Waiter::spawn(pin, Arc::clone(&callbacks))?;
                info!("Started interrupt wait on {}", pin.name());
                entry.insert(Registration {
                    name: pin.name().to_string(),
                    callbacks,
                    waiter,
                });
            }
            Entry::Occupied(mut entry) => {
                let registration = entry.get_mut();
                registration.callbacks.lock().push(callback);

                if registration.waiter.is_finished() {
                    warn!(
                        "Interrupt wait on {} had stopped, restarting",
                        registration.name
                    );
                    let waiter = match Waiter::spawn(pin, Arc::clone(&registration.callbacks)) {
                        Ok(waiter) => waiter,
                        Err(e) => {
                            registration.callbacks.lock().pop();
                            return Err(e);
                        }
                    };
                    let old = mem::replace(&mut registration.waiter, waiter);
                    if let Err(e) = old.join() {
                        warn!("Previous wait on {} ended with: {}", registration.name, e);
                    }
                }
            }
        }

        debug!("Registered interrupt callback on {}", pin.name());
        Ok(())
    }

    /// Stop the pin's wait loop and drop its callbacks.
    ///
    /// Blocks until the loop thread has exited, so no callback for this pin
    /// runs after this returns. If the loop had already failed, that failure
    /// is returned here.
    pub fn cancel<P: PinDevice + ?Sized>(&self, pin: &P) -> Result<()> {
        let registration = {
            let mut registrations = self.registrations.lock();
            match registrations.get(&pin.number()) {
                None => {
                    return Err(GpioError::Precondition(format!(
                        "no interrupt wait running on {}",
                        pin.name()
                    )))
                }
                Some(r) if r.waiter.is_current_thread() => {
                    return Err(GpioError::Precondition(format!(
                        "cannot cancel {} from its own callback",
                        pin.name()
                    )))
                }
                Some(_) => {}
            }
            registrations.remove(&pin.number())
        };

        match registration {
            Some(registration) => {
                let result = registration.waiter.stop_and_join();
                info!("Cancelled interrupt wait on {}", registration.name);
                result
            }
            None => Ok(()),
        }
    }

    /// Cancel every pin. Loop failures are logged, not returned.
    pub fn cancel_all(&self) {
        let registrations: Vec<Registration> = {
            let mut map = self.registrations.lock();
            map.drain().map(|(_, r)| r).collect()
        };

        for registration in registrations {
            if registration.waiter.is_current_thread() {
                warn!(
                    "Not joining interrupt wait on {} from its own thread",
                    registration.name
                );
                registration.waiter.stop.store(true, Ordering::SeqCst);
                continue;
            }
            if let Err(e) = registration.waiter.stop_and_join() {
                warn!("Interrupt wait on {} ended with: {}", registration.name, e);
            }
        }
    }

    /// Whether a wait loop is currently running for the pin.
    pub fn is_waiting<P: PinDevice + ?Sized>(&self, pin: &P) -> bool {
        self.registrations
            .lock()
            .get(&pin.number())
            .map_or(false, |r| !r.waiter.is_finished())
    }

    pub fn callback_count<P: PinDevice + ?Sized>(&self, pin: &P) -> usize {
        self.registrations
            .lock()
            .get(&pin.number())
            .map_or(0, |r| r.callbacks.lock().len())
    }
}

impl Drop for InterruptDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn wait_loop(
    name: String,
    source: Box<dyn EdgeSource>,
    wake: UnixStream,
    stop: Arc<AtomicBool>,
    callbacks: CallbackList,
) -> Result<()> {
    let result = run_wait_loop(&name, source, &wake, &stop, &callbacks);
    match &result {
        Ok(()) => debug!("Interrupt loop for {} exited", name),
        Err(e) => error!("Interrupt loop for {} failed: {}", name, e),
    }
    result
}

fn run_wait_loop(
    name: &str,
    mut source: Box<dyn EdgeSource>,
    wake: &UnixStream,
    stop: &AtomicBool,
    callbacks: &Mutex<Vec<Callback>>,
) -> Result<()> {
    // Clear whatever state is already pending so the first wake-up is a real edge.
    source.read_value()?;

    let edge_events = source.poll_events();

    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut fds = [
            libc::pollfd {
                fd: source.raw_fd(),
                events: edge_events,
                revents: 0,
            },
            libc::pollfd {
                fd: wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: `fds` is a valid array of pollfd for the duration of the call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(GpioError::io(format!("waiting for edge on {}", name))(err));
        }

        if fds[1].revents != 0 {
            return Ok(());
        }

        let ready = edge_events | libc::POLLHUP | libc::POLLNVAL;
        if fds[0].revents & ready != 0 {
            let value = source.read_value()?;
            let snapshot: Vec<Callback> = callbacks.lock().clone();
            debug!(
                "Edge on {}: value={} ({} callbacks)",
                name,
                value,
                snapshot.len()
            );
            for callback in &snapshot {
                callback(&value);
            }
        }
    }
}
