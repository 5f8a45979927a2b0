// Copyright 2024-2026 GG-DEPLOY Contributors
// SPDX-License-Identifier: Apache-2.0

//! `inspect`: stream a model container through the incremental parser.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::Serialize;

use crate::format::{CompiledModel, IncrementalModelParser, RootModel};

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub dynamic: bool,
    pub weight_bytes: usize,
    pub tasks: usize,
    pub tbe_kernels: usize,
    pub cust_kernels: usize,
}

impl ModelSummary {
    fn of(model: &CompiledModel) -> Self {
        let describe = |t: &crate::format::TensorDesc| format!("{}:{:?}{:?}", t.name, t.dtype, t.shape);
        Self {
            name: model.name().to_string(),
            inputs: model.def.inputs.iter().map(describe).collect(),
            outputs: model.def.outputs.iter().map(describe).collect(),
            dynamic: model.def.has_dynamic_shape(),
            weight_bytes: model.weights.len(),
            tasks: model.tasks.len(),
            tbe_kernels: model.tbe_kernels.len(),
            cust_kernels: model.cust_kernels.len(),
        }
    }
}

/// Parse `bytes` in `chunk`-sized pieces, as a device would receive them.
pub fn parse_chunked(bytes: &[u8], chunk: usize) -> Result<RootModel, crate::format::ParseError> {
    let mut parser = IncrementalModelParser::new(bytes.len() as u64);
    let mut offset = 0u64;
    for piece in bytes.chunks(chunk.max(1)) {
        parser.parse_and_deserialize(offset, piece)?;
        offset += piece.len() as u64;
    }
    parser.model().cloned()
}

/// Returns the exit code.
pub fn run_inspect(path: &Path, chunk: usize, json: bool) -> i32 {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open {}: {}", path.display(), e);
            return 1;
        }
    };
    // SAFETY: the file is opened read-only and not expected to change while mapped.
    let mmap = match unsafe { Mmap::map(&file) } {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to map {}: {}", path.display(), e);
            return 1;
        }
    };
    let root = match parse_chunked(&mmap, chunk) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Parse failed: {}", e);
            return 1;
        }
    };

    let mut summaries = vec![ModelSummary::of(&root.root)];
    summaries.extend(root.submodels.values().map(|m| ModelSummary::of(m)));
    if json {
        match serde_json::to_string_pretty(&summaries) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Failed to render summary: {}", e);
                return 1;
            }
        }
    } else {
        println!("{} ({} bytes, {} model(s))", path.display(), mmap.len(), summaries.len());
        for s in &summaries {
            println!("  {}{}", s.name, if s.dynamic { " [dynamic]" } else { "" });
            println!("    inputs:  {}", s.inputs.join(", "));
            println!("    outputs: {}", s.outputs.join(", "));
            println!(
                "    weights={}B tasks={} tbe_kernels={} cust_kernels={}",
                s.weight_bytes, s.tasks, s.tbe_kernels, s.cust_kernels
            );
        }
    }
    0
}
