//! Deduplicating task queue.
//!
//! The queue is a coordinator task, not a shared data structure: it alone
//! owns the pending list, the set of keys ever accepted, and the count of
//! accepted-but-unfinished tasks. Workers talk to it through bounded
//! channels, which is also where backpressure on discovery comes from.
//!
//! Offers and done signals from one worker travel over the same FIFO
//! channel, so the coordinator always sees a task's discoveries before the
//! signal that finished it. Without that ordering the coordinator could
//! observe zero unfinished tasks while offers are still buffered and shut
//! down early.
//!
//! A task is counted from the moment its key is first offered until
//! [`Queue::done`] is called for it. The coordinator exits exactly when no
//! accepted task remains unfinished; at that point [`Queue::take`] returns
//! `None` and the workers drain out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use url::Url;

/// One URL to fetch, identified by its canonical key.
#[derive(Debug, Clone)]
pub struct Task {
    pub download_url: Url,
    pub key: String,
}

const CHANNEL_CAPACITY: usize = 64;

enum Message {
    Offer(Task),
    Done,
}

/// Handle to the queue coordinator.
pub struct Queue {
    msg_tx: mpsc::Sender<Message>,
    take_rx: Mutex<mpsc::Receiver<Task>>,
}

impl Queue {
    /// Starts the coordinator with the initial task set. Duplicate keys
    /// among the seeds are suppressed.
    pub fn start(initial: Vec<Task>) -> Arc<Self> {
        let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(1);

        let mut coordinator = Coordinator {
            pending: VecDeque::new(),
            seen: HashSet::new(),
            in_flight: 0,
        };
        for task in initial {
            coordinator.accept(task);
        }
        tokio::spawn(coordinator.run(msg_rx, out_tx));

        Arc::new(Queue {
            msg_tx,
            take_rx: Mutex::new(out_rx),
        })
    }

    /// Offers a discovered task. A key that was ever offered before is
    /// discarded silently. Blocks only while the coordinator is busy.
    pub async fn offer(&self, task: Task) {
        let _ = self.msg_tx.send(Message::Offer(task)).await;
    }

    /// Takes the next pending task, waiting while the queue is empty but
    /// work is still in flight. Returns `None` once the queue is quiescent.
    pub async fn take(&self) -> Option<Task> {
        self.take_rx.lock().await.recv().await
    }

    /// Marks one taken task as finished. Must be called exactly once per
    /// task returned by [`Queue::take`], after all of its discoveries have
    /// been offered.
    pub async fn done(&self) {
        let _ = self.msg_tx.send(Message::Done).await;
    }
}

struct Coordinator {
    pending: VecDeque<Task>,
    seen: HashSet<String>,
    in_flight: usize,
}

impl Coordinator {
    fn accept(&mut self, task: Task) {
        if self.seen.insert(task.key.clone()) {
            self.pending.push_back(task);
            self.in_flight += 1;
        }
    }

    async fn run(mut self, mut msg_rx: mpsc::Receiver<Message>, out_tx: mpsc::Sender<Task>) {
        while self.in_flight > 0 {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(Message::Offer(task)) => self.accept(task),
                    Some(Message::Done) => {
                        // A done signal without a matching accepted task
                        // means a worker double-counted; the termination
                        // invariant is gone, so give up loudly.
                        assert!(self.in_flight > 0, "done signal without a task in flight");
                        self.in_flight -= 1;
                    }
                    // Every queue handle is gone.
                    None => break,
                },
                permit = out_tx.reserve(), if !self.pending.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(task) = self.pending.pop_front() {
                                permit.send(task);
                            }
                        }
                        // All take handles are gone; nobody can finish the
                        // remaining work.
                        Err(_) => break,
                    }
                }
            }
        }
        // Dropping out_tx wakes every waiting take() with `None`.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str) -> Task {
        let download_url = Url::parse(url).unwrap();
        Task {
            key: download_url.to_string(),
            download_url,
        }
    }

    #[tokio::test]
    async fn test_fifo_order_and_quiescence() {
        let queue = Queue::start(vec![task("http://t/1"), task("http://t/2")]);

        let first = queue.take().await.unwrap();
        assert_eq!(first.key, "http://t/1");
        queue.done().await;

        let second = queue.take().await.unwrap();
        assert_eq!(second.key, "http://t/2");
        queue.done().await;

        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_seeds_suppressed() {
        let queue = Queue::start(vec![task("http://t/1"), task("http://t/1")]);
        assert!(queue.take().await.is_some());
        queue.done().await;
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_offers_discarded() {
        let queue = Queue::start(vec![task("http://t/1")]);

        let _taken = queue.take().await.unwrap();
        queue.offer(task("http://t/2")).await;
        queue.offer(task("http://t/2")).await;
        queue.offer(task("http://t/1")).await; // already seen as a seed
        queue.done().await;

        assert!(queue.take().await.is_some());
        queue.done().await;
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_take_waits_for_in_flight_discovery() {
        let queue = Queue::start(vec![task("http://t/1")]);
        let taken = queue.take().await.unwrap();
        assert_eq!(taken.key, "http://t/1");

        // A second take must block while the first task is unfinished; give
        // it a moment, then publish new work from the "worker".
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.offer(task("http://t/2")).await;
        queue.done().await;
        let next = waiter.await.unwrap().unwrap();
        assert_eq!(next.key, "http://t/2");
        queue.done().await;
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn test_terminates_after_exactly_one_done_per_task() {
        // One seed whose processing discovers 50 new tasks, none of which
        // discover more: the coordinator must exit after 51 done calls.
        let queue = Queue::start(vec![task("http://t/seed")]);
        let mut done_calls = 0u32;

        let seed = queue.take().await.unwrap();
        assert_eq!(seed.key, "http://t/seed");
        for i in 0..50 {
            queue.offer(task(&format!("http://t/{i}"))).await;
        }
        queue.done().await;
        done_calls += 1;

        while let Some(_task) = queue.take().await {
            queue.done().await;
            done_calls += 1;
        }
        assert_eq!(done_calls, 51);
    }

    #[tokio::test]
    async fn test_concurrent_workers_drain_everything() {
        let queue = Queue::start(vec![task("http://t/seed")]);
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            workers.spawn(async move {
                let mut processed = 0u32;
                while let Some(t) = queue.take().await {
                    if t.key.ends_with("/seed") {
                        for i in 0..20 {
                            queue.offer(task(&format!("http://t/{i}"))).await;
                        }
                    }
                    queue.done().await;
                    processed += 1;
                }
                processed
            });
        }
        let mut total = 0;
        while let Some(processed) = workers.join_next().await {
            total += processed.unwrap();
        }
        assert_eq!(total, 21);
    }
}
