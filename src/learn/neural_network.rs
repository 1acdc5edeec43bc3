/*!
# Example
A discriminator block might look like this:
```
use dcgan::learn::neural_network::layer::{BatchNorm, Conv, Forward, Layer, LeakyRelu};

#[derive(Layer, Forward)]
struct Block {
    #[dcgan(layer)]
    conv: Conv,
    #[dcgan(layer)]
    norm: BatchNorm,
    #[dcgan(layer)]
    activation: LeakyRelu,
}
```
*/

/// Variables and Parameters
pub mod autograd;
/// Criterion implementations for variables.
pub mod criterion;
/// Layers
pub mod layer;
/// Optimizers
pub mod optimizer;
