use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use stockguard_events::Subscription;

use super::WorkerHandle;

const TICK: Duration = Duration::from_millis(250);

/// Generic consumer loop over a bus subscription.
///
/// - Applies a handler to every delivered message
/// - The handler must be idempotent (at-least-once delivery)
/// - Stops on shutdown or when the subscription disconnects
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<M, H, E>(name: &str, subscription: Subscription<M>, mut handler: H) -> io::Result<WorkerHandle>
    where
        M: Send + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || consume(&worker, subscription, shutdown_rx, &mut handler))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join))
    }
}

fn consume<M, H, E>(name: &str, sub: Subscription<M>, shutdown_rx: mpsc::Receiver<()>, handler: &mut H)
where
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Display,
{
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(TICK) {
            Ok(msg) => {
                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = %err, "projection handler failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker = name, "subscription closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn handler_sees_every_message_until_shutdown() {
        let (tx, rx) = mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let seen = seen.clone();
            ProjectionWorker::spawn("test-worker", Subscription::new(rx), move |n: u32| {
                seen.lock().unwrap().push(n);
                Ok::<_, String>(())
            })
            .unwrap()
        };

        for n in 0..3 {
            tx.send(n).unwrap();
        }
        for _ in 0..100 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn worker_exits_when_the_subscription_closes() {
        let (tx, rx) = mpsc::channel::<u32>();
        let handle = ProjectionWorker::spawn("closing", Subscription::new(rx), |_| Ok::<_, String>(())).unwrap();

        drop(tx);
        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_finished());
        handle.shutdown();
    }
}
