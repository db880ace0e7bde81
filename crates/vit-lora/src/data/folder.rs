use std::path::{Path, PathBuf};

use globwalk::DirEntry;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::labels::LabelMap;

/// Image file extensions picked up when scanning a folder.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["bmp", "jpg", "jpeg", "png"];

/// A labeled image, decoded lazily by the batcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// A classification dataset laid out as `root/<class name>/<image>`.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    items: Vec<ImageItem>,
    labels: LabelMap,
}

impl ImageFolder {
    /// Scans `root` and derives the label mapping from the class folder names.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "`{}` is not a directory",
                root.display()
            )));
        }

        let walker = globwalk::GlobWalkerBuilder::from_patterns(
            root,
            &[format!("*.{{{}}}", SUPPORTED_EXTENSIONS.join(","))],
        )
        .follow_links(true)
        .case_insensitive(true)
        .sort_by(|p1: &DirEntry, p2: &DirEntry| p1.path().cmp(p2.path()))
        .build()
        .map_err(|err| Error::Dataset(format!("{err:?}")))?
        .filter_map(core::result::Result::ok);

        // Label name is the parent folder name
        let mut raw = Vec::new();
        for entry in walker {
            let path = entry.path().to_path_buf();
            let class = path
                .parent()
                .filter(|parent| *parent != root)
                .and_then(Path::file_name)
                .ok_or_else(|| {
                    Error::Dataset(format!(
                        "`{}` is not inside a class folder",
                        path.display()
                    ))
                })?
                .to_string_lossy()
                .into_owned();
            raw.push((path, class));
        }

        if raw.is_empty() {
            return Err(Error::Dataset(format!(
                "no images found under `{}`",
                root.display()
            )));
        }

        let classes: Vec<&str> = raw.iter().map(|(_, class)| class.as_str()).collect();
        let labels = LabelMap::from_names(&classes)?;
        if labels.len() < 2 {
            return Err(Error::Dataset(format!(
                "at least two classes are required, found {}",
                labels.len()
            )));
        }

        let items = raw
            .into_iter()
            .map(|(path, class)| {
                let label = labels
                    .id(&class)
                    .ok_or_else(|| Error::Labels(format!("unknown class `{class}`")))?;
                Ok(ImageItem { path, label })
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Found {} images in {} classes under {}",
            items.len(),
            labels.len(),
            root.display()
        );

        Ok(Self { items, labels })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn into_parts(self) -> (Vec<ImageItem>, LabelMap) {
        (self.items, self.labels)
    }

    /// Re-expresses the item labels in the ids of `labels`, matching classes by name.
    ///
    /// Every class folder must be known to `labels`, the reverse is not required.
    pub fn relabel(self, labels: &LabelMap) -> Result<Vec<ImageItem>> {
        let ids = self
            .labels
            .names()
            .iter()
            .map(|name| {
                labels.id(name).ok_or_else(|| {
                    Error::Labels(format!("class `{name}` is not known to the model"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self
            .items
            .into_iter()
            .map(|item| ImageItem {
                label: ids[item.label],
                path: item.path,
            })
            .collect())
    }
}
