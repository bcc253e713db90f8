/*
 * Synchronization Primitives
 *
 * The raw spinlock and the wait queue are the load-bearing pieces;
 * condition variable, counting semaphore and barrier are thin
 * compositions over them.
 */

mod barrier;
mod condvar;
mod semaphore;
mod spinlock;
mod waitqueue;

pub use barrier::Barrier;
pub use condvar::CondVar;
pub use semaphore::Semaphore;
pub use spinlock::Spinlock;
pub use waitqueue::WaitQueue;
