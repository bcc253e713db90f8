/*
 * Core Tunables
 *
 * Compile-time parameters for the thread and synchronization core.
 * Values here are deliberate defaults; embedders that need different
 * limits change them in one place.
 */

/// Smallest allocation unit used for default stacks.
pub const PAGE_SIZE: usize = 4096;

/// Stack size used when a caller passes `stack_size == 0` to `create`.
pub const DEFAULT_STACK_SIZE: usize = PAGE_SIZE;

/// Maximum length of a thread name. Longer names are truncated on set.
pub const MAX_NAME_LEN: usize = 32;

/// Number of slots in the global thread-local storage key table.
pub const TLS_MAX_KEYS: usize = 64;

/// Minimum number of passes the exit-time TLS destructor sweep makes over
/// the key table. Destructors may store fresh values into other slots;
/// each extra pass picks those up.
pub const MIN_DESTRUCT_ITER: usize = 4;

/// Upper bound on CPUs the core tracks per-CPU state for.
pub const MAX_CPUS: usize = 64;

/// Number of parent stack frames `fork_current` attempts to clone.
/// When the deepest frame pointer does not resolve inside the parent's
/// stack bounds, the clone falls back to a single frame.
pub const STACK_CLONE_DEPTH: usize = 2;

/// Extra bytes kept below the cloned region of a forked stack so a return
/// address can be planted even when only one caller frame exists.
pub const LAUNCHPAD: usize = 16;
