//! Observer list over channels: delivery in registration order, subscribers
//! that hung up are dropped on the next publish.

use std::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};

use crate::worker::lock;

#[derive(Debug)]
pub struct Fanout<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, item: &T) {
        lock(&self.subscribers).retain(|tx| tx.send(item.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}
