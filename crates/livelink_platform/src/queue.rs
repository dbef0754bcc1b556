#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Unbounded multi-producer multi-consumer FIFO.
///
/// `dequeue` never blocks; pollers are expected to back off themselves
/// when the queue runs dry.
#[derive(Debug)]
pub struct WorkQueue<T> {
	inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for WorkQueue<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for WorkQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> WorkQueue<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(VecDeque::new())),
		}
	}

	pub fn enqueue(&self, item: T) {
		self.inner.lock().push_back(item);
	}

	/// Pop the oldest item, if any.
	pub fn dequeue(&self) -> Option<T> {
		self.inner.lock().pop_front()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fifo_order() {
		let q = WorkQueue::new();
		q.enqueue(1);
		q.enqueue(2);
		q.enqueue(3);

		assert_eq!(q.len(), 3);
		assert_eq!(q.dequeue(), Some(1));
		assert_eq!(q.dequeue(), Some(2));
		assert_eq!(q.dequeue(), Some(3));
		assert_eq!(q.dequeue(), None);
		assert!(q.is_empty());
	}

	#[test]
	fn dequeue_on_empty_is_none_not_blocking() {
		let q: WorkQueue<String> = WorkQueue::new();
		assert_eq!(q.dequeue(), None);
	}

	#[test]
	fn clones_share_the_same_queue() {
		let q = WorkQueue::new();
		let producer = q.clone();
		let consumer = q.clone();

		producer.enqueue("a");
		assert_eq!(consumer.dequeue(), Some("a"));
		assert!(q.is_empty());
	}

	#[test]
	fn concurrent_producers_lose_nothing() {
		let q = WorkQueue::new();

		let handles: Vec<_> = (0..4)
			.map(|t| {
				let q = q.clone();
				std::thread::spawn(move || {
					for i in 0..100 {
						q.enqueue(t * 100 + i);
					}
				})
			})
			.collect();

		for h in handles {
			h.join().expect("producer thread");
		}

		let mut seen = 0;
		while q.dequeue().is_some() {
			seen += 1;
		}
		assert_eq!(seen, 400);
	}
}
