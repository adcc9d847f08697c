//! A GAN training pipeline for face images, built on a small scalar autograd engine
//! with a PyTorch-like API.

pub mod backprop_fns;
pub mod checkpoint;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod loss;
pub mod models;
pub mod nn;
pub mod optim;
pub mod summary;
pub mod tensor;
pub mod train;
pub mod values;
