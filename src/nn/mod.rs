pub mod loss;

pub use loss::{
    LossBreakdown, difference_loss, gaussian_kl, region_weighted_mse, total_loss,
    variational_bound_loss,
};
