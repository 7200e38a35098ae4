//! Reference video transformer with a DINO projection head
//!
//! Every frame is split into `patch_size` patches that are linearly embedded
//! and offset by a fixed 2-D sin/cos position code. One learned query token
//! per output stream attends over `[token; patches]` with multi-head
//! attention, frame summaries are averaged over time, and the result goes
//! through the projection head:
//!
//! ```text
//! f -> Linear -> GELU -> Linear -> L2 normalize -> last_layer -> logits
//! ```
//!
//! Hidden patches are replaced by a learned mask token. The masked-modeling
//! branch reconstructs the raw pixels of hidden patches from the mask token,
//! its position code and the pooled frame summary.

use super::network::{
    AttentionOutput, ForwardOutput, GradMode, MaskedOutput, Network, Seed, TapeId, TokenMask,
};
use super::ops::{
    gelu, gelu_grad, l2_normalize_rows, l2_normalize_rows_backward, outer, softmax_inplace,
    softmax_rows,
};
use super::Tensor;
use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, Array4, Array5, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

const NORM_EPS: f32 = 1e-12;

/// Hyperparameters of [`VisionTransformer`]
#[derive(Debug, Clone, PartialEq)]
pub struct VitConfig {
    pub arch: String,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub num_streams: usize,
    pub head_hidden_dim: usize,
    pub bottleneck_dim: usize,
    pub out_dim: usize,
    /// Use unit-norm rows of the last layer, training only their direction
    pub norm_last_layer: bool,
    pub init_std: f32,
    pub seed: u64,
}

impl VitConfig {
    pub fn new(arch: &str, embed_dim: usize, num_heads: usize) -> Self {
        Self {
            arch: arch.to_string(),
            embed_dim,
            num_heads,
            patch_size: 16,
            in_chans: 3,
            num_streams: 1,
            head_hidden_dim: 2048,
            bottleneck_dim: 256,
            out_dim: 65536,
            norm_last_layer: true,
            init_std: 0.02,
            seed: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::InvalidParameter(format!(
                "embed_dim {} must be a positive multiple of num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if self.patch_size == 0 || self.in_chans == 0 {
            return Err(Error::InvalidParameter(
                "patch_size and in_chans must be positive".to_string(),
            ));
        }
        if !(1..=2).contains(&self.num_streams) {
            return Err(Error::InvalidParameter(format!(
                "num_streams must be 1 or 2, got {}",
                self.num_streams
            )));
        }
        if self.head_hidden_dim == 0 || self.bottleneck_dim == 0 || self.out_dim == 0 {
            return Err(Error::InvalidParameter(
                "projection head dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn patch_dim(&self) -> usize {
        self.in_chans * self.patch_size * self.patch_size
    }
}

/// Indices of each parameter in the flat parameter list
#[derive(Debug, Clone)]
struct Slots {
    patch_w: usize,
    patch_b: usize,
    mask_token: usize,
    tokens: Vec<usize>,
    q: usize,
    k: usize,
    v: usize,
    mlp0_w: usize,
    mlp0_b: usize,
    mlp1_w: usize,
    mlp1_b: usize,
    last: usize,
    dec_w: usize,
    dec_b: usize,
}

struct FrameTokens {
    patches: Array2<f32>,
    hidden: Vec<bool>,
    embed: Array2<f32>,
}

struct PoolCache {
    x: Array2<f32>,
    q: Array1<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    attn: Array2<f32>,
}

struct HeadCache {
    f: Array2<f32>,
    u: Array2<f32>,
    h1: Array2<f32>,
    normalized: Array2<f32>,
    norms: Array1<f32>,
    /// Row-normalised last layer and its row norms
    last: Option<(Array2<f32>, Array1<f32>)>,
}

struct ViewCache {
    batch: usize,
    frames: usize,
    tokens: Vec<FrameTokens>,
    /// `[stream][frame]`
    pools: Vec<Vec<PoolCache>>,
    heads: Vec<HeadCache>,
}

struct MaskedFrame {
    tokens: FrameTokens,
    pool: PoolCache,
    hidden_idx: Vec<usize>,
    inputs: Array2<f32>,
    residual: Array2<f32>,
}

struct MaskedCache {
    count: usize,
    frames: Vec<MaskedFrame>,
}

enum Record {
    Logits(Vec<ViewCache>),
    Masked(MaskedCache),
}

/// Gradient accumulators, every parameter viewed as a matrix (vectors as one row)
struct Grads {
    mats: Vec<Array2<f32>>,
}

impl Grads {
    fn new(params: &[Tensor]) -> Self {
        let mats = params
            .iter()
            .map(|p| match p.shape() {
                [r, c] => Array2::zeros((*r, *c)),
                _ => Array2::zeros((1, p.len())),
            })
            .collect();
        Self { mats }
    }

    fn vec_add(&mut self, slot: usize, g: ArrayView1<'_, f32>) {
        let mut row = self.mats[slot].row_mut(0);
        row += &g;
    }

    fn flush(self, params: &mut [Tensor]) {
        for (p, g) in params.iter_mut().zip(self.mats.iter()) {
            p.accumulate_grad_matrix(g);
        }
    }
}

/// Tiny vision transformer implementing [`Network`]
pub struct VisionTransformer {
    config: VitConfig,
    names: Vec<String>,
    params: Vec<Tensor>,
    slots: Slots,
    tape: Vec<Option<Record>>,
}

impl VisionTransformer {
    pub fn new(config: VitConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let d = config.embed_dim;
        let p = config.patch_dim();
        let std = config.init_std;

        let mut names = Vec::new();
        let mut params = Vec::new();
        let mut push = |name: &str, t: Tensor| {
            names.push(name.to_string());
            params.push(t);
            params.len() - 1
        };

        let patch_w = push("patch_embed.weight", Tensor::trunc_normal(&[d, p], std, &mut rng)?);
        let patch_b = push("patch_embed.bias", Tensor::zeros(&[d], true));
        let mask_token = push("mask_token", Tensor::zeros(&[d], true));
        let mut tokens = vec![push("cls_token", Tensor::trunc_normal(&[d], std, &mut rng)?)];
        if config.num_streams == 2 {
            tokens.push(push("aux_token", Tensor::trunc_normal(&[d], std, &mut rng)?));
        }
        let q = push("pool.q.weight", Tensor::trunc_normal(&[d, d], std, &mut rng)?);
        let k = push("pool.k.weight", Tensor::trunc_normal(&[d, d], std, &mut rng)?);
        let v = push("pool.v.weight", Tensor::trunc_normal(&[d, d], std, &mut rng)?);
        let hd = config.head_hidden_dim;
        let bn = config.bottleneck_dim;
        let mlp0_w = push("head.mlp.0.weight", Tensor::trunc_normal(&[hd, d], std, &mut rng)?);
        let mlp0_b = push("head.mlp.0.bias", Tensor::zeros(&[hd], true));
        let mlp1_w = push("head.mlp.1.weight", Tensor::trunc_normal(&[bn, hd], std, &mut rng)?);
        let mlp1_b = push("head.mlp.1.bias", Tensor::zeros(&[bn], true));
        let last = push(
            "head.last_layer.weight",
            Tensor::trunc_normal(&[config.out_dim, bn], std, &mut rng)?,
        );
        let dec_w = push("decoder.weight", Tensor::trunc_normal(&[p, d], std, &mut rng)?);
        let dec_b = push("decoder.bias", Tensor::zeros(&[p], true));

        Ok(Self {
            config,
            names,
            params,
            slots: Slots {
                patch_w,
                patch_b,
                mask_token,
                tokens,
                q,
                k,
                v,
                mlp0_w,
                mlp0_b,
                mlp1_w,
                mlp1_b,
                last,
                dec_w,
                dec_b,
            },
            tape: Vec::new(),
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }

    fn head_dim(&self) -> usize {
        self.config.embed_dim / self.config.num_heads
    }

    fn vector(&self, slot: usize) -> ArrayView1<'_, f32> {
        self.params[slot].data().view()
    }

    /// Split a `(C, H, W)` frame into `(tokens, C * p * p)` patch rows
    fn patchify(&self, view: &Array5<f32>, b: usize, t: usize) -> Result<(Array2<f32>, usize, usize)> {
        let (_, c, _, h, w) = view.dim();
        let p = self.config.patch_size;
        let (gh, gw) = (h / p, w / p);
        let mut patches = Array2::zeros((gh * gw, c * p * p));
        for i in 0..gh {
            for j in 0..gw {
                let mut row = patches.row_mut(i * gw + j);
                let block = view.slice(s![b, .., t, i * p..(i + 1) * p, j * p..(j + 1) * p]);
                for (dst, src) in row.iter_mut().zip(block.iter()) {
                    *dst = *src;
                }
            }
        }
        Ok((patches, gh, gw))
    }

    fn check_view(&self, view: &Array5<f32>) -> Result<()> {
        let (_, c, t, h, w) = view.dim();
        let p = self.config.patch_size;
        if c != self.config.in_chans || t == 0 || h % p != 0 || w % p != 0 || h < p || w < p {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.config.in_chans, 1, p, p],
                got: view.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Patch embeddings with position codes; hidden rows use the mask token
    fn embed(&self, patches: &Array2<f32>, hidden: &[bool], gh: usize, gw: usize) -> Result<Array2<f32>> {
        let w = self.params[self.slots.patch_w].matrix()?;
        let mut e = patches.dot(&w.t());
        e += &self.vector(self.slots.patch_b);
        let mask_token = self.vector(self.slots.mask_token);
        for (n, &is_hidden) in hidden.iter().enumerate() {
            if is_hidden {
                e.row_mut(n).assign(&mask_token);
            }
        }
        e += &sincos_position(gh, gw, self.config.embed_dim);
        Ok(e)
    }

    fn frame_tokens(
        &self,
        view: &Array5<f32>,
        b: usize,
        t: usize,
        hidden: Option<Vec<bool>>,
    ) -> Result<FrameTokens> {
        let (patches, gh, gw) = self.patchify(view, b, t)?;
        let hidden = hidden.unwrap_or_else(|| vec![false; gh * gw]);
        let embed = self.embed(&patches, &hidden, gh, gw)?;
        Ok(FrameTokens {
            patches,
            hidden,
            embed,
        })
    }

    /// Attention pooling of `[token; embed]` by the query token of `stream`
    fn pool(&self, stream: usize, embed: &Array2<f32>) -> Result<(Array1<f32>, PoolCache)> {
        let d = self.config.embed_dim;
        let heads = self.config.num_heads;
        let dh = self.head_dim();
        let scale = (dh as f32).powf(-0.5);
        let token = self.vector(self.slots.tokens[stream]);

        let mut x = Array2::zeros((embed.nrows() + 1, d));
        x.row_mut(0).assign(&token);
        x.slice_mut(s![1.., ..]).assign(embed);

        let q = self.params[self.slots.q].matrix()?.dot(&token);
        let k = x.dot(&self.params[self.slots.k].matrix()?.t());
        let v = x.dot(&self.params[self.slots.v].matrix()?.t());

        let mut attn = Array2::zeros((heads, x.nrows()));
        let mut z = token.to_owned();
        for h in 0..heads {
            let span = h * dh..(h + 1) * dh;
            let q_h = q.slice(s![span.clone()]);
            let mut a = attn.row_mut(h);
            a.assign(&(k.slice(s![.., span.clone()]).dot(&q_h) * scale));
            softmax_inplace(a.view_mut());
            let o_h = v.slice(s![.., span]).t().dot(&a);
            let mut z_h = z.slice_mut(s![h * dh..(h + 1) * dh]);
            z_h += &o_h;
        }
        Ok((z, PoolCache { x, q, k, v, attn }))
    }

    /// Backward of [`Self::pool`]; returns d(embed) and accumulates the rest
    fn pool_backward(
        &self,
        stream: usize,
        cache: &PoolCache,
        dz: ArrayView1<'_, f32>,
        grads: &mut Grads,
    ) -> Result<Array2<f32>> {
        let d = self.config.embed_dim;
        let dh = self.head_dim();
        let scale = (dh as f32).powf(-0.5);
        let rows = cache.x.nrows();

        let mut d_token = dz.to_owned();
        let mut dk = Array2::<f32>::zeros((rows, d));
        let mut dv = Array2::<f32>::zeros((rows, d));
        let mut dq = Array1::<f32>::zeros(d);

        for h in 0..self.config.num_heads {
            let span = h * dh..(h + 1) * dh;
            let a = cache.attn.row(h);
            let do_h = dz.slice(s![span.clone()]);
            let mut dv_h = dv.slice_mut(s![.., span.clone()]);
            dv_h += &outer(a, do_h);
            let da = cache.v.slice(s![.., span.clone()]).dot(&do_h);
            let dot = a.dot(&da);
            let ds = (&da - dot) * &a * scale;
            let mut dq_h = dq.slice_mut(s![span.clone()]);
            dq_h += &cache.k.slice(s![.., span.clone()]).t().dot(&ds);
            let mut dk_h = dk.slice_mut(s![.., span.clone()]);
            dk_h += &outer(ds.view(), cache.q.slice(s![span]));
        }

        let token = cache.x.row(0);
        grads.mats[self.slots.q] += &outer(dq.view(), token);
        d_token += &self.params[self.slots.q].matrix()?.t().dot(&dq);

        grads.mats[self.slots.k] += &dk.t().dot(&cache.x);
        grads.mats[self.slots.v] += &dv.t().dot(&cache.x);
        let mut dx = dk.dot(&self.params[self.slots.k].matrix()?);
        dx += &dv.dot(&self.params[self.slots.v].matrix()?);

        d_token += &dx.row(0);
        grads.vec_add(self.slots.tokens[stream], d_token.view());
        Ok(dx.slice(s![1.., ..]).to_owned())
    }

    /// Route d(embed) to the patch projection or the mask token
    fn embed_backward(&self, tokens: &FrameTokens, d_embed: &Array2<f32>, grads: &mut Grads) {
        let mut visible = d_embed.clone();
        let mut d_mask = Array1::<f32>::zeros(self.config.embed_dim);
        for (n, &is_hidden) in tokens.hidden.iter().enumerate() {
            if is_hidden {
                d_mask += &d_embed.row(n);
                visible.row_mut(n).fill(0.0);
            }
        }
        grads.mats[self.slots.patch_w] += &visible.t().dot(&tokens.patches);
        grads.vec_add(self.slots.patch_b, visible.sum_axis(Axis(0)).view());
        grads.vec_add(self.slots.mask_token, d_mask.view());
    }

    fn head(&self, f: Array2<f32>) -> Result<(Array2<f32>, HeadCache)> {
        let mut u = f.dot(&self.params[self.slots.mlp0_w].matrix()?.t());
        u += &self.vector(self.slots.mlp0_b);
        let h1 = u.mapv(gelu);
        let mut h2 = h1.dot(&self.params[self.slots.mlp1_w].matrix()?.t());
        h2 += &self.vector(self.slots.mlp1_b);
        let (normalized, norms) = l2_normalize_rows(&h2, NORM_EPS);
        let raw = self.params[self.slots.last].matrix()?;
        let last = if self.config.norm_last_layer {
            Some(l2_normalize_rows(&raw.to_owned(), NORM_EPS))
        } else {
            None
        };
        let logits = match &last {
            Some((w, _)) => normalized.dot(&w.t()),
            None => normalized.dot(&raw.t()),
        };
        Ok((
            logits,
            HeadCache {
                f,
                u,
                h1,
                normalized,
                norms,
                last,
            },
        ))
    }

    fn head_backward(&self, cache: &HeadCache, d_logits: &Array2<f32>, grads: &mut Grads) -> Result<Array2<f32>> {
        let dw = d_logits.t().dot(&cache.normalized);
        let dn = match &cache.last {
            Some((w, w_norms)) => {
                grads.mats[self.slots.last] += &l2_normalize_rows_backward(w, w_norms, &dw, NORM_EPS);
                d_logits.dot(w)
            }
            None => {
                grads.mats[self.slots.last] += &dw;
                d_logits.dot(&self.params[self.slots.last].matrix()?)
            }
        };
        let dh2 = l2_normalize_rows_backward(&cache.normalized, &cache.norms, &dn, NORM_EPS);
        grads.mats[self.slots.mlp1_w] += &dh2.t().dot(&cache.h1);
        grads.vec_add(self.slots.mlp1_b, dh2.sum_axis(Axis(0)).view());
        let dh1 = dh2.dot(&self.params[self.slots.mlp1_w].matrix()?);
        let du = &dh1 * &cache.u.mapv(gelu_grad);
        grads.mats[self.slots.mlp0_w] += &du.t().dot(&cache.f);
        grads.vec_add(self.slots.mlp0_b, du.sum_axis(Axis(0)).view());
        Ok(du.dot(&self.params[self.slots.mlp0_w].matrix()?))
    }

    /// Forward one view through every stream
    fn forward_view(&self, view: &Array5<f32>) -> Result<(Vec<Array2<f32>>, ViewCache)> {
        self.check_view(view)?;
        let (batch, _, frames, _, _) = view.dim();
        let streams = self.config.num_streams;
        let d = self.config.embed_dim;

        let mut tokens = Vec::with_capacity(batch * frames);
        let mut pools: Vec<Vec<PoolCache>> = (0..streams).map(|_| Vec::new()).collect();
        let mut features: Vec<Array2<f32>> = (0..streams).map(|_| Array2::zeros((batch, d))).collect();

        for b in 0..batch {
            for t in 0..frames {
                let ft = self.frame_tokens(view, b, t, None)?;
                for s in 0..streams {
                    let (z, cache) = self.pool(s, &ft.embed)?;
                    let mut row = features[s].row_mut(b);
                    row.scaled_add(1.0 / frames as f32, &z);
                    pools[s].push(cache);
                }
                tokens.push(ft);
            }
        }

        let mut logits = Vec::with_capacity(streams);
        let mut heads = Vec::with_capacity(streams);
        for f in features {
            let (l, cache) = self.head(f)?;
            logits.push(l);
            heads.push(cache);
        }
        Ok((
            logits,
            ViewCache {
                batch,
                frames,
                tokens,
                pools,
                heads,
            },
        ))
    }

    fn record(&mut self, record: Record) -> TapeId {
        self.tape.push(Some(record));
        TapeId(self.tape.len() - 1)
    }

    fn take_record(&mut self, tape: TapeId) -> Result<Record> {
        self.tape
            .get_mut(tape.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::InvalidParameter(format!("no recorded forward for {tape:?}")))
    }

    fn backward_logits(&self, views: &[ViewCache], grads_in: &[Array2<f32>], grads: &mut Grads) -> Result<()> {
        if grads_in.len() != self.config.num_streams {
            return Err(Error::InvalidParameter(format!(
                "expected {} stream gradients, got {}",
                self.config.num_streams,
                grads_in.len()
            )));
        }
        let mut offset = 0;
        for view in views {
            let rows = offset..offset + view.batch;
            let mut d_embed: Vec<Array2<f32>> = view
                .tokens
                .iter()
                .map(|ft| Array2::zeros(ft.embed.raw_dim()))
                .collect();
            for (s, g) in grads_in.iter().enumerate() {
                if g.nrows() < rows.end {
                    return Err(Error::ShapeMismatch {
                        expected: vec![rows.end, self.config.out_dim],
                        got: g.shape().to_vec(),
                    });
                }
                let d_logits = g.slice(s![rows.clone(), ..]).to_owned();
                let df = self.head_backward(&view.heads[s], &d_logits, grads)?;
                for b in 0..view.batch {
                    let dz = df.row(b).mapv(|v| v / view.frames as f32);
                    for t in 0..view.frames {
                        let idx = b * view.frames + t;
                        let de = self.pool_backward(s, &view.pools[s][idx], dz.view(), grads)?;
                        d_embed[idx] += &de;
                    }
                }
            }
            for (ft, de) in view.tokens.iter().zip(d_embed.iter()) {
                self.embed_backward(ft, de, grads);
            }
            offset += view.batch;
        }
        Ok(())
    }

    fn backward_masked(&self, cache: &MaskedCache, grad: f32, grads: &mut Grads) -> Result<()> {
        if cache.count == 0 {
            return Ok(());
        }
        let pdim = self.config.patch_dim() as f32;
        let coef = grad * 2.0 / (pdim * cache.count as f32);
        let dec_w = self.params[self.slots.dec_w].matrix()?;
        for frame in &cache.frames {
            if frame.hidden_idx.is_empty() {
                continue;
            }
            let d_pred = frame.residual.mapv(|r| r * coef);
            grads.mats[self.slots.dec_w] += &d_pred.t().dot(&frame.inputs);
            grads.vec_add(self.slots.dec_b, d_pred.sum_axis(Axis(0)).view());
            let d_inputs = d_pred.dot(&dec_w);
            let dz = d_inputs.sum_axis(Axis(0));
            let mut d_embed = self.pool_backward(0, &frame.pool, dz.view(), grads)?;
            for (row, &n) in frame.hidden_idx.iter().enumerate() {
                let mut target = d_embed.row_mut(n);
                target += &d_inputs.row(row);
            }
            self.embed_backward(&frame.tokens, &d_embed, grads);
        }
        Ok(())
    }
}

/// Fixed 2-D sin/cos position code, rows for the first half of the channels
pub fn sincos_position(gh: usize, gw: usize, dim: usize) -> Array2<f32> {
    let half = (dim / 2).max(1);
    let mut pos = Array2::zeros((gh * gw, dim));
    for i in 0..gh {
        for j in 0..gw {
            let mut row = pos.row_mut(i * gw + j);
            for c in 0..dim {
                let (coord, k) = if c < half { (i, c) } else { (j, c - half) };
                let freq = 1.0 / 10000f32.powf((k / 2) as f32 * 2.0 / half as f32);
                let angle = coord as f32 * freq;
                row[c] = if k % 2 == 0 { angle.sin() } else { angle.cos() };
            }
        }
    }
    pos
}

impl Network for VisionTransformer {
    fn arch(&self) -> &str {
        &self.config.arch
    }

    fn num_streams(&self) -> usize {
        self.config.num_streams
    }

    fn patch_size(&self) -> usize {
        self.config.patch_size
    }

    fn out_dim(&self) -> usize {
        self.config.out_dim
    }

    fn parameter_names(&self) -> &[String] {
        &self.names
    }

    fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut self.params
    }

    fn forward(&mut self, views: &[Array5<f32>], mode: GradMode) -> Result<ForwardOutput> {
        if views.is_empty() {
            return Err(Error::InvalidParameter("forward needs at least one view".to_string()));
        }
        let mut per_view = Vec::with_capacity(views.len());
        let mut caches = Vec::with_capacity(views.len());
        for view in views {
            let (logits, cache) = self.forward_view(view)?;
            per_view.push(logits);
            caches.push(cache);
        }
        let streams = (0..self.config.num_streams)
            .map(|s| {
                let parts: Vec<_> = per_view.iter().map(|l| l[s].view()).collect();
                ndarray::concatenate(Axis(0), &parts).map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        let tape = match mode {
            GradMode::Record => Some(self.record(Record::Logits(caches))),
            GradMode::Inference => None,
        };
        Ok(ForwardOutput { streams, tape })
    }

    fn forward_with_attention(&self, views: &[Array5<f32>]) -> Result<AttentionOutput> {
        let heads = self.config.num_heads;
        let dh = self.head_dim();
        let scale = (dh as f32).powf(-0.5);
        let wq = self.params[self.slots.q].matrix()?;
        let wk = self.params[self.slots.k].matrix()?;

        let mut per_view = Vec::with_capacity(views.len());
        let mut attentions = Vec::with_capacity(views.len());
        for view in views {
            let (logits, cache) = self.forward_view(view)?;
            per_view.push(logits);
            let n1 = cache.tokens.first().map(|t| t.embed.nrows() + 1).unwrap_or(1);
            let mut maps = Array4::<f32>::zeros((cache.tokens.len(), heads, n1, n1));
            for (f, pool) in cache.pools[0].iter().enumerate() {
                let q_all = pool.x.dot(&wq.t());
                let k_all = pool.x.dot(&wk.t());
                for h in 0..heads {
                    let span = h * dh..(h + 1) * dh;
                    let scores =
                        q_all.slice(s![.., span.clone()]).dot(&k_all.slice(s![.., span]).t()) * scale;
                    maps.slice_mut(s![f, h, .., ..]).assign(&softmax_rows(&scores));
                }
            }
            attentions.push(maps);
        }
        let streams = (0..self.config.num_streams)
            .map(|s| {
                let parts: Vec<_> = per_view.iter().map(|l| l[s].view()).collect();
                ndarray::concatenate(Axis(0), &parts).map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(AttentionOutput { streams, attentions })
    }

    fn masked_modeling(
        &mut self,
        views: &[Array5<f32>],
        masks: &[TokenMask],
        mode: GradMode,
    ) -> Result<MaskedOutput> {
        if views.len() != masks.len() {
            return Err(Error::InvalidParameter(format!(
                "{} views but {} masks",
                views.len(),
                masks.len()
            )));
        }
        let p = self.config.patch_size;
        let mut frames_out = Vec::new();
        let mut sq_err = 0.0f64;
        let mut count = 0usize;

        for (view, mask) in views.iter().zip(masks) {
            self.check_view(view)?;
            let (batch, _, frames, h, w) = view.dim();
            let expected = (batch * frames, h / p, w / p);
            if mask.dim() != expected {
                return Err(Error::ShapeMismatch {
                    expected: vec![expected.0, expected.1, expected.2],
                    got: mask.shape().to_vec(),
                });
            }
            let dec_w = self.params[self.slots.dec_w].matrix()?;
            let dec_b = self.vector(self.slots.dec_b);
            for b in 0..batch {
                for t in 0..frames {
                    let hidden: Vec<bool> =
                        mask.slice(s![b * frames + t, .., ..]).iter().copied().collect();
                    let tokens = self.frame_tokens(view, b, t, Some(hidden))?;
                    let (z, pool) = self.pool(0, &tokens.embed)?;
                    let hidden_idx: Vec<usize> = tokens
                        .hidden
                        .iter()
                        .enumerate()
                        .filter_map(|(n, &m)| m.then_some(n))
                        .collect();
                    let mut inputs = Array2::zeros((hidden_idx.len(), self.config.embed_dim));
                    let mut targets = Array2::zeros((hidden_idx.len(), tokens.patches.ncols()));
                    for (row, &n) in hidden_idx.iter().enumerate() {
                        inputs.row_mut(row).assign(&(&tokens.embed.row(n) + &z));
                        targets.row_mut(row).assign(&tokens.patches.row(n));
                    }
                    let mut pred = inputs.dot(&dec_w.t());
                    pred += &dec_b;
                    let residual = pred - &targets;
                    sq_err += residual
                        .rows()
                        .into_iter()
                        .map(|r| (r.dot(&r) / r.len() as f32) as f64)
                        .sum::<f64>();
                    count += hidden_idx.len();
                    if mode == GradMode::Record {
                        frames_out.push(MaskedFrame {
                            tokens,
                            pool,
                            hidden_idx,
                            inputs,
                            residual,
                        });
                    }
                }
            }
        }

        let loss = if count == 0 {
            0.0
        } else {
            (sq_err / count as f64) as f32
        };
        let tape = match mode {
            GradMode::Record => Some(self.record(Record::Masked(MaskedCache {
                count,
                frames: frames_out,
            }))),
            GradMode::Inference => None,
        };
        Ok(MaskedOutput {
            loss,
            hidden_tokens: count,
            tape,
        })
    }

    fn backward(&mut self, seeds: &[Seed]) -> Result<()> {
        let mut grads = Grads::new(&self.params);
        for seed in seeds {
            match seed {
                Seed::Logits { tape, grads: upstream } => match self.take_record(*tape)? {
                    Record::Logits(views) => self.backward_logits(&views, upstream, &mut grads)?,
                    Record::Masked(_) => {
                        return Err(Error::InvalidParameter(format!(
                            "{tape:?} is a masked-modeling record"
                        )))
                    }
                },
                Seed::Scalar { tape, grad } => match self.take_record(*tape)? {
                    Record::Masked(cache) => self.backward_masked(&cache, *grad, &mut grads)?,
                    Record::Logits(_) => {
                        return Err(Error::InvalidParameter(format!("{tape:?} is a logits record")))
                    }
                },
            }
        }
        grads.flush(&mut self.params);
        self.tape.clear();
        Ok(())
    }

    fn clear_tape(&mut self) {
        self.tape.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;
    use rand::Rng;

    fn tiny(streams: usize) -> VisionTransformer {
        let mut cfg = VitConfig::new("vit_test", 8, 2);
        cfg.patch_size = 4;
        cfg.in_chans = 1;
        cfg.num_streams = streams;
        cfg.head_hidden_dim = 6;
        cfg.bottleneck_dim = 4;
        cfg.out_dim = 5;
        cfg.init_std = 0.5;
        cfg.seed = 3;
        VisionTransformer::new(cfg).unwrap()
    }

    fn clip(batch: usize, frames: usize, size: usize, seed: u64) -> Array5<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array5::from_shape_fn((batch, 1, frames, size, size), |_| rng.gen_range(-1.0..1.0))
    }

    fn weighted_logits(net: &mut VisionTransformer, views: &[Array5<f32>], w: &[Array2<f32>]) -> f32 {
        let out = net.forward(views, GradMode::Inference).unwrap();
        out.streams.iter().zip(w).map(|(l, w)| (l * w).sum()).sum()
    }

    #[test]
    fn test_forward_shapes_are_view_major() {
        let mut net = tiny(2);
        let views = vec![clip(3, 2, 8, 1), clip(3, 2, 4, 2)];
        let out = net.forward(&views, GradMode::Inference).unwrap();
        assert_eq!(out.streams.len(), 2);
        assert_eq!(out.streams[0].dim(), (6, 5));
        assert!(out.tape.is_none());
    }

    #[test]
    fn test_attention_maps_shape_and_rows() {
        let net = tiny(1);
        let out = net.forward_with_attention(&[clip(2, 3, 8, 4)]).unwrap();
        let att = &out.attentions[0];
        assert_eq!(att.dim(), (6, 2, 5, 5));
        let row_sum: f32 = att.slice(s![0, 1, 0, ..]).sum();
        assert_relative_eq!(row_sum, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_rejects_indivisible_view() {
        let mut net = tiny(1);
        let err = net.forward(&[clip(1, 1, 6, 0)], GradMode::Inference);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_logit_gradients_match_finite_differences() {
        let mut net = tiny(2);
        let views = vec![clip(2, 2, 8, 5), clip(2, 2, 4, 6)];
        let mut rng = StdRng::seed_from_u64(11);
        let w: Vec<Array2<f32>> = (0..2)
            .map(|_| Array2::from_shape_fn((4, 5), |_| rng.gen_range(-1.0..1.0)))
            .collect();

        let out = net.forward(&views, GradMode::Record).unwrap();
        net.backward(&[Seed::Logits {
            tape: out.tape.unwrap(),
            grads: w.clone(),
        }])
        .unwrap();

        let h = 1e-2;
        for slot in 0..net.params.len() {
            let Some(grad) = net.params[slot].grad().cloned() else {
                continue;
            };
            for idx in [0, net.params[slot].len() / 2] {
                let orig = net.params[slot].data()[idx];
                net.params[slot].data_mut()[idx] = orig + h;
                let up = weighted_logits(&mut net, &views, &w);
                net.params[slot].data_mut()[idx] = orig - h;
                let down = weighted_logits(&mut net, &views, &w);
                net.params[slot].data_mut()[idx] = orig;
                let fd = (up - down) / (2.0 * h);
                assert!(
                    (fd - grad[idx]).abs() < 2e-2 + 5e-2 * fd.abs(),
                    "{} [{idx}]: analytic {} vs numeric {fd}",
                    net.names[slot],
                    grad[idx]
                );
            }
        }
    }

    #[test]
    fn test_masked_modeling_gradients_match_finite_differences() {
        let mut net = tiny(1);
        let views = vec![clip(1, 2, 8, 9)];
        let mut mask = Array3::from_elem((2, 2, 2), false);
        mask[[0, 0, 1]] = true;
        mask[[1, 1, 0]] = true;
        mask[[1, 0, 0]] = true;
        let masks = vec![mask];

        let out = net.masked_modeling(&views, &masks, GradMode::Record).unwrap();
        assert_eq!(out.hidden_tokens, 3);
        net.backward(&[Seed::Scalar {
            tape: out.tape.unwrap(),
            grad: 1.0,
        }])
        .unwrap();

        let h = 1e-2;
        for slot in [net.slots.mask_token, net.slots.dec_w, net.slots.q, net.slots.patch_w] {
            let grad = net.params[slot].grad().cloned().unwrap();
            for idx in [0, net.params[slot].len() - 1] {
                let orig = net.params[slot].data()[idx];
                net.params[slot].data_mut()[idx] = orig + h;
                let up = net.masked_modeling(&views, &masks, GradMode::Inference).unwrap().loss;
                net.params[slot].data_mut()[idx] = orig - h;
                let down = net.masked_modeling(&views, &masks, GradMode::Inference).unwrap().loss;
                net.params[slot].data_mut()[idx] = orig;
                let fd = (up - down) / (2.0 * h);
                assert!(
                    (fd - grad[idx]).abs() < 2e-2 + 5e-2 * fd.abs(),
                    "{} [{idx}]: analytic {} vs numeric {fd}",
                    net.names[slot],
                    grad[idx]
                );
            }
        }
    }

    #[test]
    fn test_masked_modeling_without_hidden_tokens_is_zero() {
        let mut net = tiny(1);
        let masks = vec![Array3::from_elem((1, 2, 2), false)];
        let out = net
            .masked_modeling(&[clip(1, 1, 8, 2)], &masks, GradMode::Record)
            .unwrap();
        assert_eq!(out.loss, 0.0);
        net.backward(&[Seed::Scalar {
            tape: out.tape.unwrap(),
            grad: 1.0,
        }])
        .unwrap();
        assert!(net.params.iter().all(|p| p.grad().map_or(true, |g| g.iter().all(|v| *v == 0.0))));
    }

    #[test]
    fn test_backward_rejects_consumed_tape() {
        let mut net = tiny(1);
        let out = net.forward(&[clip(1, 1, 4, 0)], GradMode::Record).unwrap();
        let seed = Seed::Logits {
            tape: out.tape.unwrap(),
            grads: vec![Array2::ones((1, 5))],
        };
        net.backward(&[seed.clone()]).unwrap();
        assert!(net.backward(&[seed]).is_err());
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = tiny(1);
        let b = tiny(1);
        assert_eq!(a.state_dict(), b.state_dict());
    }
}
