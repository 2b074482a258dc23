use std::collections::BTreeSet;
use std::path::PathBuf;

use hf_hub::api::sync::ApiRepo;

use crate::paligemma::CandleVlmError;

/// Names of the safetensors shards listed in the `weight_map` of a sharded index file.
///
/// Each shard appears once, in name order.
pub fn weight_files(index: &serde_json::Value) -> Result<Vec<String>, CandleVlmError> {
    let Some(weight_map) = index.get("weight_map") else {
        return Err(CandleVlmError::InvalidWeightIndex(
            "no weight map".to_string(),
        ));
    };
    let Some(weight_map) = weight_map.as_object() else {
        return Err(CandleVlmError::InvalidWeightIndex(
            "the weight map is not an object".to_string(),
        ));
    };

    let files: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    Ok(files.into_iter().map(str::to_string).collect())
}

/// Download every shard referenced by the index file of a hub repository.
pub fn hub_load_safetensors(
    repo: &ApiRepo,
    json_file: &str,
) -> Result<Vec<PathBuf>, CandleVlmError> {
    let json_path = repo.get(json_file)?;
    let json_file = std::fs::File::open(&json_path)?;
    let index: serde_json::Value = serde_json::from_reader(json_file)
        .map_err(|e| CandleVlmError::InvalidWeightIndex(e.to_string()))?;

    weight_files(&index)?
        .iter()
        .map(|file| repo.get(file).map_err(CandleVlmError::from))
        .collect()
}
