// Neural network building blocks
//
// Kernels, leaf layers, containers and the PeleeNet family built from them.

pub mod container;
pub mod functional;
pub mod layers;
pub mod peleenet;

pub use container::{DataParallel, ModuleList, Sequential};
pub use layers::{AvgPool2d, BatchNorm2d, Conv2d, Linear, MaxPool2d, ReLU};
pub use peleenet::{
    BasicConv2d, DenseBlock, DenseLayer, PeleeNet, PeleeNetConfig, StemBlock, TransitionBlock,
};
