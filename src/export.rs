//! llama2.c-compatible `.bin` export of the next-token model.
//!
//! Only the trunk, final norm and the (tied) classifier are written; auxiliary
//! multi-token heads are a training-time device and have no place in the format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::check_points::{CheckpointFiles, CheckpointMeta};
use crate::model::attention::Block;
use crate::model::builder::build_transformer;
use crate::model::Transformer;

const V1_MAGIC: u32 = 0x616b_3432; // "ak42"
const V1_HEADER_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportVersion {
    /// Headerless legacy layout read by `run.c`.
    #[default]
    V0,
    /// Magic + version header padded to 256 bytes, norms grouped first.
    V1,
}

impl std::str::FromStr for ExportVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" | "v0" => Ok(Self::V0),
            "1" | "v1" => Ok(Self::V1),
            other => anyhow::bail!("unknown export version {other:?} (expected 0 or 1)"),
        }
    }
}

pub fn export_model(model: &Transformer, path: &Path, version: ExportVersion) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    match version {
        ExportVersion::V0 => write_v0(model, &mut out)?,
        ExportVersion::V1 => write_v1(model, &mut out)?,
    }
    out.flush()?;
    info!(path = %path.display(), ?version, "exported model");
    Ok(())
}

/// Rebuilds the model of the latest checkpoint in `checkpoint_dir` on the CPU and exports it.
pub fn export_checkpoint(checkpoint_dir: &Path, path: &Path, version: ExportVersion) -> Result<()> {
    let files = CheckpointFiles::latest(checkpoint_dir)
        .with_context(|| format!("no checkpoint found in {}", checkpoint_dir.display()))?;
    let meta = CheckpointMeta::from_file(&files.meta)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = build_transformer(vb, &meta.model_args, DType::F32)?;
    varmap
        .load(&files.model)
        .with_context(|| format!("failed to load {}", files.model.display()))?;
    info!(iter = meta.iter_num, "loaded checkpoint for export");
    export_model(&model, path, version)
}

/// `dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, max_seq_len`.
///
/// The classifier is always tied to the embedding, so `vocab_size` stays positive.
fn header_params(model: &Transformer) -> Result<[i32; 7]> {
    let args = model.args();
    let hidden_dim = model.layers()[0].feed_forward.w1.dim(0)?;
    let params = [
        args.dim,
        hidden_dim,
        args.n_layers,
        args.n_heads,
        args.n_kv_heads,
        args.vocab_size,
        args.max_seq_len,
    ];
    let mut header = [0i32; 7];
    for (slot, value) in header.iter_mut().zip(params) {
        *slot = i32::try_from(value)
            .with_context(|| format!("{value} does not fit an i32 header field"))?;
    }
    Ok(header)
}

fn write_v0<W: Write>(model: &Transformer, out: &mut W) -> Result<()> {
    for value in header_params(model)? {
        out.write_all(&value.to_le_bytes())?;
    }
    let layers = model.layers();
    serialize_fp32(out, model.tok_embeddings())?;
    write_each(out, layers, |b| &b.attention_norm)?;
    write_each(out, layers, |b| &b.attention.wq)?;
    write_each(out, layers, |b| &b.attention.wk)?;
    write_each(out, layers, |b| &b.attention.wv)?;
    write_each(out, layers, |b| &b.attention.wo)?;
    write_each(out, layers, |b| &b.ffn_norm)?;
    write_each(out, layers, |b| &b.feed_forward.w1)?;
    write_each(out, layers, |b| &b.feed_forward.w2)?;
    write_each(out, layers, |b| &b.feed_forward.w3)?;
    serialize_fp32(out, model.norm())?;

    let (cos, sin) = model.rope().tables();
    let max_seq_len = model.args().max_seq_len;
    serialize_fp32(out, &cos.narrow(0, 0, max_seq_len)?)?;
    serialize_fp32(out, &sin.narrow(0, 0, max_seq_len)?)?;
    Ok(())
}

fn write_v1<W: Write>(model: &Transformer, out: &mut W) -> Result<()> {
    let mut header = Vec::with_capacity(V1_HEADER_BYTES);
    header.extend_from_slice(&V1_MAGIC.to_le_bytes());
    header.extend_from_slice(&1i32.to_le_bytes());
    for value in header_params(model)? {
        header.extend_from_slice(&value.to_le_bytes());
    }
    header.push(1u8); // shared classifier
    ensure!(header.len() <= V1_HEADER_BYTES, "v1 header overflow");
    header.resize(V1_HEADER_BYTES, 0);
    out.write_all(&header)?;

    let layers = model.layers();
    write_each(out, layers, |b| &b.attention_norm)?;
    write_each(out, layers, |b| &b.ffn_norm)?;
    serialize_fp32(out, model.norm())?;
    serialize_fp32(out, model.tok_embeddings())?;
    write_each(out, layers, |b| &b.attention.wq)?;
    write_each(out, layers, |b| &b.attention.wk)?;
    write_each(out, layers, |b| &b.attention.wv)?;
    write_each(out, layers, |b| &b.attention.wo)?;
    write_each(out, layers, |b| &b.feed_forward.w1)?;
    write_each(out, layers, |b| &b.feed_forward.w2)?;
    write_each(out, layers, |b| &b.feed_forward.w3)?;
    Ok(())
}

fn write_each<W, F>(out: &mut W, layers: &[Block], pick: F) -> Result<()>
where
    W: Write,
    F: Fn(&Block) -> &Tensor,
{
    for layer in layers {
        serialize_fp32(out, pick(layer))?;
    }
    Ok(())
}

/// Row-major little-endian f32 dump of `t`.
fn serialize_fp32<W: Write>(out: &mut W, t: &Tensor) -> Result<()> {
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    out.write_all(&bytes)?;
    Ok(())
}
