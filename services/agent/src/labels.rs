//! Label derivation from container state.
//!
//! Selectors see a flat label namespace; this module produces it from a
//! container snapshot. Besides the container's declared labels there are
//! three synthetic families: `image` (reference without tag), `tag` (the
//! tag *with its leading colon*, so catalog-side and derived values compare
//! equal), and `env.<NAME>` for environment variables.

use std::collections::BTreeMap;

use tether_model::Labeled;

use crate::runtime::ContainerSnapshot;

/// Image reference up to (not including) the last `:`, or the whole
/// reference if it has none.
pub fn image_name(image: &str) -> &str {
    match image.rfind(':') {
        Some(colon) => &image[..colon],
        None => image,
    }
}

/// Image tag from the last `:` onward, colon included; `":latest"` when
/// the reference carries no tag.
pub fn image_tag(image: &str) -> String {
    match image.rfind(':') {
        Some(colon) => image[colon..].to_string(),
        None => ":latest".to_string(),
    }
}

fn env_value(env: &[String], key: &str) -> String {
    for entry in env {
        let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if name == key {
            return value.to_string();
        }
    }
    String::new()
}

/// Label view over a container, for selector evaluation.
pub struct ContainerLabels<'a>(pub &'a ContainerSnapshot);

impl Labeled for ContainerLabels<'_> {
    fn label(&self, key: &str) -> String {
        match key {
            "image" => image_name(&self.0.image).to_string(),
            "tag" => image_tag(&self.0.image),
            _ => match key.strip_prefix("env.") {
                Some(name) => env_value(&self.0.env, name),
                None => self.0.labels.get(key).cloned().unwrap_or_default(),
            },
        }
    }
}

/// Full label map recorded on a registered instance: synthetic `image` /
/// `tag` first, overlaid by the container's own labels, plus `env.*`
/// entries (which cannot collide thanks to the prefix).
pub fn instance_labels(container: &ContainerSnapshot) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("image".to_string(), image_name(&container.image).to_string());
    labels.insert("tag".to_string(), image_tag(&container.image));
    for (key, value) in &container.labels {
        labels.insert(key.clone(), value.clone());
    }
    for entry in &container.env {
        let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        labels.insert(format!("env.{name}"), value.to_string());
    }
    labels
}
