//! Container serialization, the inverse of [`IncrementalModelParser`].
//!
//! [`IncrementalModelParser`]: super::IncrementalModelParser

use super::codec::ByteWriter;
use super::model::CompiledModel;
use super::{PartitionType, FORMAT_VERSION, HEADER_SIZE, MODEL_MAGIC};

/// Serialize `models` into one container; the first model becomes the root.
///
/// The custom-kernel partition is only written when it has entries.
pub fn serialize_models(models: &[CompiledModel]) -> Vec<u8> {
    let mut body = ByteWriter::default();
    for model in models {
        write_model(&mut body, model);
    }
    let body = body.into_inner();

    let mut out = ByteWriter::with_capacity(HEADER_SIZE + body.len());
    out.put_u32(MODEL_MAGIC)
        .put_u32(FORMAT_VERSION)
        .put_u32(models.len() as u32)
        .put_u32(0)
        .put_u64(body.len() as u64)
        .put_bytes(&body);
    out.into_inner()
}

fn write_model(out: &mut ByteWriter, model: &CompiledModel) {
    // Serializing plain data structs to JSON does not fail.
    let def = serde_json::to_vec(&model.def).unwrap_or_default();
    let tasks = serde_json::to_vec(&model.tasks).unwrap_or_default();
    let mut partitions = vec![
        (PartitionType::ModelDef, def),
        (PartitionType::Weights, model.weights.clone()),
        (PartitionType::TaskInfo, tasks),
        (PartitionType::TbeKernels, model.tbe_kernels.encode()),
    ];
    if !model.cust_kernels.is_empty() {
        partitions.push((PartitionType::CustAicpuKernels, model.cust_kernels.encode()));
    }

    out.put_u32(partitions.len() as u32);
    for (kind, bytes) in &partitions {
        out.put_u32(kind.as_u32()).put_u64(bytes.len() as u64);
    }
    for (_, bytes) in &partitions {
        out.put_bytes(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::model::ModelDef;
    use crate::format::IncrementalModelParser;

    #[test]
    fn custom_kernels_add_fifth_partition() {
        let mut model = CompiledModel::new(ModelDef::new("m"));
        let four = serialize_models(&[model.clone()]);
        assert_eq!(u32::from_le_bytes([four[24], four[25], four[26], four[27]]), 4);

        model.cust_kernels.insert("c", vec![1]);
        let five = serialize_models(&[model.clone()]);
        assert_eq!(u32::from_le_bytes([five[24], five[25], five[26], five[27]]), 5);

        let mut parser = IncrementalModelParser::new(five.len() as u64);
        parser.parse_and_deserialize(0, &five).unwrap();
        assert_eq!(parser.model().unwrap().root.cust_kernels.get("c"), Some(&[1u8][..]));
    }

    #[test]
    fn header_length_excludes_header() {
        let bytes = serialize_models(&[CompiledModel::new(ModelDef::new("m"))]);
        let declared = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(declared as usize, bytes.len() - HEADER_SIZE);
    }
}
