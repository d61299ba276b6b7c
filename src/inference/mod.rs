//! Model side of the prediction pipeline: input standardization, image preprocessing, ONNX
//! execution and normalization of raw model outputs.

pub mod adapter;
pub mod features;
pub mod onnx;
pub mod preprocess;
