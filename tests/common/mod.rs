//! Shared fixtures for the integration tests

use destilar::config::TrainSpec;
use std::path::Path;

/// Tiny backbone, tiny clips, two batches per epoch on one worker
pub fn tiny_spec(output_dir: &Path) -> TrainSpec {
    let mut spec = TrainSpec::default();
    spec.model.arch = "vit_tiny".to_string();
    spec.model.patch_size = 4;
    spec.model.out_dim = 16;
    spec.model.head_hidden_dim = 16;
    spec.model.bottleneck_dim = 8;
    spec.model.embed_dim = Some(8);
    spec.model.num_heads = Some(2);
    spec.crops.global_size = 16;
    spec.crops.local_size = 8;
    spec.crops.local_crops = 2;
    spec.masking.ratio = 0.5;
    spec.masking.threshold = 0.75;
    spec.masking.tube_ratio = 0.5;
    spec.optimizer.lr = 0.05;
    spec.optimizer.warmup_epochs = 1;
    spec.optimizer.use_fp16 = false;
    spec.data.batch_size_per_gpu = 2;
    spec.data.num_workers = 1;
    spec.data.num_samples = 4;
    spec.data.frames = 2;
    spec.data.height = 20;
    spec.data.width = 20;
    spec.training.epochs = 3;
    spec.training.saveckp_freq = 2;
    spec.training.log_every = 1;
    spec.training.output_dir = output_dir.to_path_buf();
    spec
}
