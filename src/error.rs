use thiserror::Error;

/// Everything that can go wrong calling into a [`crate::Cube`].
///
/// `E` is the error type of the caller-supplied hooks (see
/// [`crate::CubeBuilder`]); a hook failure is surfaced verbatim through
/// [`CubeError::Hook`] once the controller's exit protocol has run.
#[derive(Error, Debug)]
pub enum CubeError<E> {
    /// Raised at a suspension point when the caller's cancellation token
    /// was observed to be set. The cube and controller are left in a
    /// consistent state; no half-applied rotation is ever visible.
    #[error("operation was cancelled before it completed")]
    Cancelled,

    /// A caller-supplied hook returned an error. Propagated after the
    /// controller's exit protocol has already released the cube.
    #[error("hook failed: {0}")]
    Hook(E),

    /// `face` was not in `0..6`.
    #[error("face index {0} is out of range (expected 0..6)")]
    FaceOutOfRange(u8),

    /// `layer` was not in `0..size`.
    #[error("layer index {0} is out of range")]
    LayerOutOfRange(usize),
}
