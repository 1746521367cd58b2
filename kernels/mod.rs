pub mod config;
pub mod covariance;
pub mod implicit_als;
pub mod kmeans;
pub mod linalg;
pub mod linear_regression;
pub mod moments;
pub mod naive_bayes;
pub mod pca;
pub mod progress;
pub mod qr;
pub mod svd;

pub use progress::{IterationObserver, IterativeAlgorithm, NoopIterationObserver};
