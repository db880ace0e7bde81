use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bidirectional mapping between class names and integer identifiers.
///
/// Identifiers are dense, `0..len`, and follow the sorted order of the class
/// names the mapping was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
    ids: BTreeMap<String, usize>,
}

/// On-disk form, `id2label` keys are strings like in a Hugging Face config.
#[derive(Serialize, Deserialize)]
struct LabelMapFile {
    id2label: BTreeMap<String, String>,
    label2id: BTreeMap<String, usize>,
}

impl LabelMap {
    /// Derives the mapping from class names, sorted and de-duplicated.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut names: Vec<String> = names.iter().map(|name| name.as_ref().to_string()).collect();
        names.sort();
        names.dedup();

        if names.is_empty() {
            return Err(Error::Labels("no class names".into()));
        }

        let ids = names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();

        Ok(Self { names, ids })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Class names ordered by identifier.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn id2label(&self) -> BTreeMap<usize, String> {
        self.names.iter().cloned().enumerate().collect()
    }

    pub fn label2id(&self) -> BTreeMap<String, usize> {
        self.ids.clone()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = LabelMapFile {
            id2label: self
                .names
                .iter()
                .enumerate()
                .map(|(id, name)| (id.to_string(), name.clone()))
                .collect(),
            label2id: self.ids.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;

        Ok(())
    }

    /// Loads a mapping and checks that both directions agree.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: LabelMapFile = serde_json::from_str(&content)?;

        let mut names = vec![None; file.id2label.len()];
        for (id, name) in file.id2label {
            let id: usize = id
                .parse()
                .map_err(|_| Error::Labels(format!("invalid id `{id}`")))?;
            let slot = names
                .get_mut(id)
                .ok_or_else(|| Error::Labels(format!("id {id} is out of range")))?;
            *slot = Some(name);
        }
        let names: Vec<String> = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| name.ok_or_else(|| Error::Labels(format!("missing id {id}"))))
            .collect::<Result<_>>()?;

        if file.label2id.len() != names.len() {
            return Err(Error::Labels(format!(
                "{} names but {} ids",
                file.label2id.len(),
                names.len()
            )));
        }
        for (id, name) in names.iter().enumerate() {
            if file.label2id.get(name) != Some(&id) {
                return Err(Error::Labels(format!(
                    "label `{name}` does not map back to id {id}"
                )));
            }
        }

        Ok(Self {
            names,
            ids: file.label2id,
        })
    }
}
