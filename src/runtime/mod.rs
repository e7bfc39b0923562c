//! Cart runtime: the single-writer command loop and its broadcast event stream.

/// Runtime events and user notices.
pub mod events;
/// [`handle::CartHandle`], the command loop and the debounced persistence worker.
pub mod handle;
