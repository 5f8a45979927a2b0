//! Fuzz target for the incremental model parser.
//!
//! Arbitrary bytes, split at arbitrary points, must only ever produce
//! errors. A chunk after a poisoning error must be refused.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use gg_deploy::format::{IncrementalModelParser, ParseStage};

#[derive(Debug, Arbitrary)]
struct Input {
    declared_size: u16,
    splits: Vec<u8>,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut parser = IncrementalModelParser::new(u64::from(input.declared_size));
    let mut offset = 0usize;
    let mut splits = input.splits.iter().map(|&s| usize::from(s).max(1)).cycle();
    while offset < input.data.len() {
        let len = splits.next().unwrap_or(input.data.len());
        let end = (offset + len).min(input.data.len());
        match parser.parse_and_deserialize(offset as u64, &input.data[offset..end]) {
            Ok(()) => offset = end,
            Err(e) => {
                if e.poisons() {
                    assert_eq!(parser.stage(), ParseStage::Poisoned);
                }
                break;
            }
        }
    }
});
