use super::autograd::{Variable, Variable0};
use crate::{
    learn::criterion::{BCELoss, Criterion},
    result::Result,
};
use ndarray::{ArcArray, Array, ArrayView, Dimension, Ix0, Zip};

impl<D: Dimension + 'static> Criterion<Variable<D>, ArcArray<f32, D>> for BCELoss {
    type Output = Variable0;
    fn eval(&self, input: Variable<D>, target: ArcArray<f32, D>) -> Result<Variable0> {
        let loss = self.eval(input.value().view(), target.view())?;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let input = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(bce_loss_backward_host(input.view(), target.view(), output_grad[()]).into_shared())
            });
        }
        Ok(builder.build(Array::from_elem((), loss).into_shared()))
    }
}

fn bce_loss_backward_host<D: Dimension>(
    x: ArrayView<f32, D>,
    t: ArrayView<f32, D>,
    dy: f32,
) -> Array<f32, D> {
    let scale = dy / x.len().max(1) as f32;
    let mut dx = Array::zeros(x.raw_dim());
    Zip::from(&mut dx).and(&x).and(&t).for_each(|dx, x, t| {
        *dx = scale * (x - t) / (x * (1. - x)).max(1e-12);
    });
    dx
}
