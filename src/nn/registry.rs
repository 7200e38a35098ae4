//! Architecture name to constructor mapping

use super::vit::{VisionTransformer, VitConfig};
use super::Network;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Construction arguments shared by every architecture
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub patch_size: usize,
    pub in_chans: usize,
    pub num_streams: usize,
    pub out_dim: usize,
    pub head_hidden_dim: usize,
    pub bottleneck_dim: usize,
    pub norm_last_layer: bool,
    /// Overrides the architecture's embedding width (tiny test backbones)
    pub embed_dim: Option<usize>,
    pub num_heads: Option<usize>,
    pub seed: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            patch_size: 16,
            in_chans: 3,
            num_streams: 1,
            out_dim: 65536,
            head_hidden_dim: 2048,
            bottleneck_dim: 256,
            norm_last_layer: true,
            embed_dim: None,
            num_heads: None,
            seed: 0,
        }
    }
}

pub type Factory = Box<dyn Fn(&BuildOptions) -> Result<Box<dyn Network>> + Send + Sync>;

/// Registry of network constructors keyed by architecture name.
///
/// Names starting with `deit` resolve to the matching `vit` entry.
pub struct ArchRegistry {
    factories: BTreeMap<String, Factory>,
}

fn vit_factory(arch: &'static str, embed_dim: usize, num_heads: usize) -> Factory {
    Box::new(move |opts: &BuildOptions| {
        let mut cfg = VitConfig::new(
            arch,
            opts.embed_dim.unwrap_or(embed_dim),
            opts.num_heads.unwrap_or(num_heads),
        );
        cfg.patch_size = opts.patch_size;
        cfg.in_chans = opts.in_chans;
        cfg.num_streams = opts.num_streams;
        cfg.out_dim = opts.out_dim;
        cfg.head_hidden_dim = opts.head_hidden_dim;
        cfg.bottleneck_dim = opts.bottleneck_dim;
        cfg.norm_last_layer = opts.norm_last_layer;
        cfg.seed = opts.seed;
        Ok(Box::new(VisionTransformer::new(cfg)?) as Box<dyn Network>)
    })
}

impl ArchRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in backbones
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("vit_tiny", vit_factory("vit_tiny", 192, 3));
        registry.register("vit_small", vit_factory("vit_small", 384, 6));
        registry.register("vit_base", vit_factory("vit_base", 768, 12));
        registry.register("timesformer", vit_factory("timesformer", 768, 12));
        registry
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Canonical registry key for `name`
    pub fn resolve(&self, name: &str) -> Result<String> {
        let canonical = match name.strip_prefix("deit") {
            Some(rest) => format!("vit{rest}"),
            None => name.to_string(),
        };
        if self.factories.contains_key(&canonical) {
            Ok(canonical)
        } else {
            Err(Error::UnknownArchitecture {
                name: name.to_string(),
                known: self.names(),
            })
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn build(&self, name: &str, opts: &BuildOptions) -> Result<Box<dyn Network>> {
        let key = self.resolve(name)?;
        let factory = self.factories.get(&key).ok_or_else(|| Error::UnknownArchitecture {
            name: name.to_string(),
            known: self.names(),
        })?;
        factory(opts)
    }

    /// Build a student and a teacher from the same factory.
    ///
    /// The teacher starts from the student's weights and never requires grad.
    pub fn build_pair(
        &self,
        name: &str,
        opts: &BuildOptions,
    ) -> Result<(Box<dyn Network>, Box<dyn Network>)> {
        let student = self.build(name, opts)?;
        let mut teacher = self.build(name, opts)?;
        verify_pairing(student.as_ref(), teacher.as_ref())?;
        teacher.load_state_dict(&student.state_dict(), true)?;
        for p in teacher.parameters_mut() {
            p.set_requires_grad(false);
        }
        Ok((student, teacher))
    }
}

impl Default for ArchRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Check that two networks pair parameter-by-parameter (order, name, shape)
pub fn verify_pairing(student: &dyn Network, teacher: &dyn Network) -> Result<()> {
    let s_names = student.parameter_names();
    let t_names = teacher.parameter_names();
    if s_names.len() != t_names.len() {
        return Err(Error::ArchitectureMismatch(format!(
            "student has {} parameters, teacher has {}",
            s_names.len(),
            t_names.len()
        )));
    }
    for (i, ((sn, tn), (sp, tp))) in s_names
        .iter()
        .zip(t_names)
        .zip(student.parameters().iter().zip(teacher.parameters()))
        .enumerate()
    {
        if sn != tn {
            return Err(Error::ArchitectureMismatch(format!(
                "parameter {i} is '{sn}' in the student but '{tn}' in the teacher"
            )));
        }
        if sp.shape() != tp.shape() {
            return Err(Error::ArchitectureMismatch(format!(
                "'{sn}' has shape {:?} in the student but {:?} in the teacher",
                sp.shape(),
                tp.shape()
            )));
        }
    }
    Ok(())
}
