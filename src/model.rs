//! Burn module for the grid-based object detector.
//!
//! The network is a plain stack of strided 3x3 convolutions followed by a 1x1 head.
//! For every grid cell and anchor the head predicts `objectness, tx, ty, tw, th` and
//! one logit per class, laid out as channel `anchor * (5 + classes) + field`.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::BaseModel;

/// Fields predicted per anchor before the class logits
pub const BOX_FIELDS: usize = 5;

// Prior box shapes in grid-cell units
pub const DEFAULT_ANCHORS: [[f32; 2]; 5] = [
    [1.08, 1.19],
    [3.42, 4.41],
    [6.63, 11.38],
    [9.42, 5.11],
    [16.62, 10.52],
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub base_model: BaseModel,
    pub num_classes: usize,
    pub input_size: usize,
    pub grid_size: usize,
    pub anchors: Vec<[f32; 2]>,
    /// Output channels of each strided convolution
    pub channels: Vec<usize>,
}

impl DetectorConfig {
    pub fn new(base_model: BaseModel, num_classes: usize) -> Self {
        let (input_size, channels) = match base_model {
            BaseModel::DarknetYolo => (416, vec![16, 32, 64, 128, 256]),
            BaseModel::TinyYolo => (208, vec![8, 16, 32, 64]),
        };
        let grid_size = input_size >> channels.len();
        Self {
            base_model,
            num_classes,
            input_size,
            grid_size,
            anchors: DEFAULT_ANCHORS.to_vec(),
            channels,
        }
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    /// Values predicted per anchor: box fields plus class logits
    pub fn fields_per_anchor(&self) -> usize {
        BOX_FIELDS + self.num_classes
    }

    pub fn output_channels(&self) -> usize {
        self.num_anchors() * self.fields_per_anchor()
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(channels_in: usize, channels_out: usize, stride: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels_in, channels_out], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.conv.forward(input))
    }
}

#[derive(Module, Debug)]
pub struct YoloDetector<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    neck: ConvBlock<B>,
    head: Conv2d<B>,
}

impl<B: Backend> YoloDetector<B> {
    pub fn new(cfg: &DetectorConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(cfg.channels.len());
        let mut channels_in = 3;
        for &channels_out in &cfg.channels {
            blocks.push(ConvBlock::new(channels_in, channels_out, 2, device));
            channels_in = channels_out;
        }
        let neck = ConvBlock::new(channels_in, channels_in, 1, device);
        let head = Conv2dConfig::new([channels_in, cfg.output_channels()], [1, 1]).init(device);
        Self { blocks, neck, head }
    }

    /// Raw head output with shape `[batch, anchors * (5 + classes), grid, grid]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.head.forward(self.neck.forward(x))
    }
}
