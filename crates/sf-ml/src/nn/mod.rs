//! Neural network building blocks on `ndarray`
//!
//! Only what the Demucs family needs: convolutions, transposed
//! convolutions, normalisation, GELU/GLU, linear layers, attention and
//! bidirectional LSTMs.

pub mod activation;
pub mod attention;
pub mod conv;
pub mod linear;
pub mod norm;
pub mod recurrent;

pub use activation::{gelu, gelu_scalar, glu};
pub use attention::{LocalAttention, MultiheadAttention};
pub use conv::{Conv2d, ConvGeometry, ConvTranspose2d};
pub use linear::Linear;
pub use norm::{GroupNorm, LayerNorm, LayerScale};
pub use recurrent::{BiLstm, ResidualBiLstm};
