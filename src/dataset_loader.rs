use csv::ReaderBuilder;
use log::info;
use std::{fs, path::Path};

use crate::error::EngineResult;

/// Text samples for tokenizer training.
pub struct Dataset {
    pub samples: Vec<String>,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetType {
    JSON,
    CSV,
}

impl DatasetType {
    /// Picks the format from the file extension; anything but `.csv` is JSON.
    pub fn from_path(p_path: &Path) -> Self {
        match p_path.extension().and_then(|e| e.to_str()) {
            Some(s_ext) if s_ext.eq_ignore_ascii_case("csv") => DatasetType::CSV,
            _ => DatasetType::JSON,
        }
    }
}

impl Dataset {
    pub fn load<P: AsRef<Path>>(p_path: P, type_of_data: DatasetType) -> EngineResult<Self> {
        let p_path = p_path.as_ref();
        let samples = match type_of_data {
            DatasetType::CSV => get_data_from_csv(p_path)?,
            DatasetType::JSON => get_data_from_json(p_path)?,
        };
        info!("loaded {} samples from {}", samples.len(), p_path.display());
        Ok(Dataset { samples })
    }

    /// Concatenates several corpus files, format chosen per file.
    pub fn load_all<P: AsRef<Path>>(v_paths: &[P]) -> EngineResult<Self> {
        let mut samples = Vec::new();
        for p in v_paths {
            let p = p.as_ref();
            samples.extend(Self::load(p, DatasetType::from_path(p))?.samples);
        }
        Ok(Dataset { samples })
    }
}

/// JSON array of strings.
fn get_data_from_json(p_path: &Path) -> EngineResult<Vec<String>> {
    let data_json = fs::read_to_string(p_path)?;
    let data: Vec<String> = serde_json::from_str(&data_json)?;
    Ok(data)
}

//===================================================================
//  get_data_from_csv
//      Reads a header-less CSV file; the columns of a record are joined
//      with "," into one sample. Blank records are skipped.
//===================================================================
fn get_data_from_csv(p_path: &Path) -> EngineResult<Vec<String>> {
    let file = fs::File::open(p_path)?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut v_data: Vec<String> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let s_line = record.iter().collect::<Vec<&str>>().join(",");
        let s_line = s_line.trim();
        if !s_line.is_empty() {
            v_data.push(s_line.to_string());
        }
    }
    Ok(v_data)
}
