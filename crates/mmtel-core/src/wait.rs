//! Caller-supplied waiting strategies.
//!
//! The ring primitives never block on the OS; a blocking claim or read is a
//! retry loop whose back-off is injected by the caller. Strategies decide
//! how to spend a failed attempt (spin hint, thread yield) and whether to
//! keep going.

/// Back-off policy for blocking claim/read loops.
pub trait WaitStrategy {
    /// Called after attempt number `attempt` (0-based) came up empty.
    /// Returns false to give up, which surfaces a `Timeout` error.
    fn wait(&mut self, attempt: u32) -> bool;
}

/// Spin for a bounded number of attempts, then yield the thread between
/// retries. Never gives up.
#[derive(Debug, Clone, Copy)]
pub struct SpinYield {
    /// Attempts to burn on a spin hint before yielding.
    pub spin_limit: u32,
}

impl Default for SpinYield {
    fn default() -> Self {
        Self { spin_limit: 64 }
    }
}

impl WaitStrategy for SpinYield {
    fn wait(&mut self, attempt: u32) -> bool {
        if attempt < self.spin_limit {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
        true
    }
}

/// Spin up to `max_attempts`, then give up.
#[derive(Debug, Clone, Copy)]
pub struct BoundedSpin {
    pub max_attempts: u32,
}

impl WaitStrategy for BoundedSpin {
    fn wait(&mut self, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        std::hint::spin_loop();
        true
    }
}
