use crate::layers::Layer;
use crate::model::NN;

use ndarray::prelude::*;

/// Per-sample cross-entropy `-sum(y * ln(p))` and the one-hot targets `y`.
///
/// The targets are what the softmax layer's backward expects.
pub fn cross_entropy(labels: &[u8], actual_y: &Array2<f32>) -> (Array1<f32>, Array2<f32>) {
    let batch_size = labels.len();
    let num_classes = actual_y.ncols();
    assert!(
        actual_y.nrows() == batch_size,
        "got {} labels for {} predictions",
        batch_size,
        actual_y.nrows()
    );

    // Convert labels to one-hot encoding Array2
    let mut expected_y = Array2::zeros((batch_size, num_classes));
    for (i, &label) in labels.iter().enumerate() {
        expected_y[(i, label as usize)] = 1.0;
    }

    // -log(p) of the true class, clamped away from ln(0)
    let log_probs = actual_y.mapv(|p| (p + 1e-10).ln());
    let loss = -(&expected_y * &log_probs).sum_axis(Axis(1));

    (loss, expected_y)
}

/// Index of the largest value of each row.
pub fn argmax_rows(probs: &Array2<f32>) -> Vec<usize> {
    probs
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (idx, &p)| {
                    if p > best.1 {
                        (idx, p)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Number of rows whose argmax is the label.
pub fn correct_predictions(labels: &[u8], probs: &Array2<f32>) -> usize {
    argmax_rows(probs)
        .into_iter()
        .zip(labels)
        .filter(|(pred, label)| *pred == **label as usize)
        .count()
}

/// Fraction of correct predictions, in [0, 1]. An empty batch has accuracy 0.
pub fn accuracy(labels: &[u8], probs: &Array2<f32>) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    correct_predictions(labels, probs) as f32 / labels.len() as f32
}

pub trait Optimizer {
    /// Run one optimization step.
    /// Note:
    /// - Assumes forward+backward pass have been done.
    /// - May mutate the optimizer internal state (e.g. moments).
    fn step(&mut self, nn: &mut NN);
}

#[derive(Clone, Debug)]
pub struct AdamState {
    // (m, v) for each parameter of the layer, e.g. [(m_w, v_w), (m_b, v_b)]
    pub params: Vec<(ArrayD<f32>, ArrayD<f32>)>,
}

impl AdamState {
    fn for_grads(grads: &[&ArrayD<f32>]) -> AdamState {
        AdamState {
            params: grads
                .iter()
                .map(|g| (ArrayD::zeros(g.raw_dim()), ArrayD::zeros(g.raw_dim())))
                .collect(),
        }
    }
}

/// Adam (Kingma & Ba), the per-parameter adaptive learning rate optimizer.
pub struct Adam {
    pub t: i32,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub states: Vec<Option<AdamState>>, // one slot per layer, None for layers without weights
}

impl Adam {
    pub fn new(nn: &NN, learning_rate: f32) -> Self {
        let states = vec![None; nn.layers.len()];

        Adam {
            t: 0,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            states,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, nn: &mut NN) {
        self.t += 1;
        let t_f32 = self.t as f32;
        let hyper = AdamHyper {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.epsilon,
            t: t_f32,
        };

        for (layer, state) in nn.layers.iter_mut().zip(self.states.iter_mut()) {
            let (weights, w_grad, bias, b_grad) = match layer {
                Layer::FC(l) => (&mut l.weights, &l.w_grad, &mut l.bias, &l.b_grad),
                Layer::Conv(l) => (&mut l.kernels_mat, &l.k_grad, &mut l.b, &l.b_grad),
                _ => continue, // no weights to update in other layers
            };
            // Layers skipped by the last backward have nothing to apply
            let (Some(w_grad), Some(b_grad)) = (w_grad.as_ref(), b_grad.as_ref()) else {
                continue;
            };
            let w_grad = w_grad.view().into_dyn().to_owned();
            let b_grad = b_grad.view().into_dyn().to_owned();

            let state = state.get_or_insert_with(|| AdamState::for_grads(&[&w_grad, &b_grad]));

            update_param(
                &mut weights.view_mut().into_dyn(),
                &w_grad,
                &mut state.params[0],
                &hyper,
            );
            update_param(
                &mut bias.view_mut().into_dyn(),
                &b_grad,
                &mut state.params[1],
                &hyper,
            );
        }
    }
}

struct AdamHyper {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: f32,
}

fn update_param(
    param: &mut ArrayViewMutD<f32>,
    grad: &ArrayD<f32>,
    state: &mut (ArrayD<f32>, ArrayD<f32>),
    hyper: &AdamHyper,
) {
    let (m, v) = state;
    let AdamHyper {
        lr,
        beta1,
        beta2,
        eps,
        t,
    } = *hyper;

    // m = beta1 * m + (1 - beta1) * grad
    m.zip_mut_with(grad, |m_val, g_val| {
        *m_val = beta1 * *m_val + (1.0 - beta1) * g_val;
    });

    // v = beta2 * v + (1 - beta2) * grad^2
    v.zip_mut_with(grad, |v_val, g_val| {
        *v_val = beta2 * *v_val + (1.0 - beta2) * g_val.powi(2);
    });

    // Bias correction
    let m_corr = 1.0 - beta1.powf(t);
    let v_corr = 1.0 - beta2.powf(t);

    // Update weight: w = w - lr * (m / m_corr) / (sqrt(v / v_corr) + eps)
    azip!((p in param, mv in &*m, vv in &*v) {
        let m_hat = mv / m_corr;
        let v_hat = vv / v_corr;
        *p -= lr * m_hat / (v_hat.sqrt() + eps);
    });
}
