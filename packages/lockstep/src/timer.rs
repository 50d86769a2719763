use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, trace};

use crate::Control;

/// Long-lived thread that requests a stop on an iteration's [`Control`] once the iteration's
/// wall-clock budget has elapsed, so worker threads never read the clock in their hot loop.
///
/// At most one iteration is armed at a time. The stop is never requested before the deadline.
#[derive(Debug)]
pub(crate) struct IterationTimer {
    command_tx: mpsc::Sender<TimerCommand>,
    join_handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
enum TimerCommand {
    Arm {
        deadline: Instant,
        control: Arc<Control>,
    },
    Disarm,
    Shutdown,
}

impl IterationTimer {
    pub(crate) fn start() -> io::Result<Self> {
        let (command_tx, command_rx) = mpsc::channel();

        let join_handle = thread::Builder::new()
            .name("lockstep-timer".to_string())
            .spawn(move || {
                debug!("timer thread started");
                timer_loop(&command_rx);
                debug!("timer thread exiting");
            })?;

        Ok(Self {
            command_tx,
            join_handle: Some(join_handle),
        })
    }

    /// Requests a stop on `control` at `deadline`, replacing any previously armed iteration.
    pub(crate) fn arm(&self, deadline: Instant, control: Arc<Control>) {
        self.command_tx
            .send(TimerCommand::Arm { deadline, control })
            .expect("timer thread lives as long as the timer handle");
    }

    /// Forgets the armed iteration, if any, without requesting a stop.
    pub(crate) fn disarm(&self) {
        self.command_tx
            .send(TimerCommand::Disarm)
            .expect("timer thread lives as long as the timer handle");
    }
}

impl Drop for IterationTimer {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that a thread has stopped.
    fn drop(&mut self) {
        // The timer thread never runs user code, so it is always safe to wait for it.
        _ = self.command_tx.send(TimerCommand::Shutdown);

        if let Some(handle) = self.join_handle.take() {
            handle.join().expect("timer thread never panics");
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Timing-only logic, covered by the deadline tests below.
fn timer_loop(command_rx: &mpsc::Receiver<TimerCommand>) {
    let mut armed: Option<(Instant, Arc<Control>)> = None;

    loop {
        let command = match &armed {
            None => match command_rx.recv() {
                Ok(command) => command,
                Err(_) => return,
            },
            Some((deadline, control)) => {
                let now = Instant::now();

                if now >= *deadline {
                    control.request_stop();
                    trace!(
                        phase = %control.params().phase(),
                        iteration = control.params().index(),
                        "iteration deadline reached"
                    );
                    armed = None;
                    continue;
                }

                match command_rx.recv_timeout(deadline.duration_since(now)) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };

        match command {
            TimerCommand::Arm { deadline, control } => armed = Some((deadline, control)),
            TimerCommand::Disarm => armed = None,
            TimerCommand::Shutdown => return,
        }
    }
}
