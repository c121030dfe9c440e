//! Worker thread draining the asynchronous sender's queue.

use std::{io, sync::Arc, thread};

use log::debug;

use crate::last_error::LastErrorSlot;

use super::{
    queue::{EventQueue, QueueItem},
    transmitter::Transmitter,
};

/// Start the worker. It owns `transmitter` until the close sentinel arrives.
pub(crate) fn spawn_worker(
    queue: Arc<EventQueue<Vec<u8>>>,
    transmitter: Transmitter,
    errors: Arc<LastErrorSlot>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("femtofluent-sender".into())
        .spawn(move || worker_loop(&queue, transmitter, &errors))
}

fn worker_loop(queue: &EventQueue<Vec<u8>>, mut transmitter: Transmitter, errors: &LastErrorSlot) {
    while let Some(item) = queue.pop() {
        match item {
            QueueItem::Item(bytes) => {
                if let Err(err) = transmitter.send(&bytes) {
                    errors.publish(err);
                }
            }
            QueueItem::Close => break,
        }
    }
    if let Err(err) = transmitter.close() {
        errors.publish(err);
    }
    debug!("femtofluent: sender worker stopped");
}
