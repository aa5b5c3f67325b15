//! Multi-document Kubernetes-style manifest, grounded on
//! `original_source/util/K8sService.py`.
//!
//! Both backends consume the same manifest shape: the Kubernetes one applies
//! the YAML documents directly, the Docker one walks the `Deployment`
//! document's container list and ignores the rest.

use serde::Deserialize;
use std::collections::HashMap;

/// One container entry inside a `Deployment`'s pod template.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub ports: Vec<u16>,
    /// volume name -> mount path inside the container.
    pub volume_mounts: HashMap<String, String>,
}

/// A service manifest: the label/port derived from the filename (which takes
/// precedence over the YAML content, per the original), plus the raw
/// documents for the cluster adapter to apply or introspect.
#[derive(Debug, Clone)]
pub struct ServiceManifest {
    pub label: String,
    pub port: u16,
    pub docs: Vec<serde_yaml::Value>,
}

impl ServiceManifest {
    pub fn parse(label: impl Into<String>, port: u16, yaml_text: &str) -> Result<Self, serde_yaml::Error> {
        let docs: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(yaml_text)
            .map(serde_yaml::Value::deserialize)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            label: label.into(),
            port,
            docs,
        })
    }

    fn kind(doc: &serde_yaml::Value) -> Option<&str> {
        doc.get("kind")?.as_str()
    }

    pub fn deployment_doc(&self) -> Option<&serde_yaml::Value> {
        self.docs.iter().find(|d| Self::kind(d) == Some("Deployment"))
    }

    /// Annotates every document with the `edge.service=<label>` label
    /// (Service, Deployment, and the Deployment's pod template), sets the
    /// initial replica count, and optionally the scheduler name — matching
    /// `K8sService.annotate`.
    pub fn annotate(&mut self, scheduler_name: Option<&str>, replicas: u32) {
        for doc in &mut self.docs {
            Self::set_label(doc, "edge.service", &self.label);

            if Self::kind(doc) == Some("Deployment") {
                if let Some(template) = doc
                    .get_mut("spec")
                    .and_then(|s| s.get_mut("template"))
                {
                    Self::set_label(template, "edge.service", &self.label);
                }
                if let Some(spec) = doc.get_mut("spec").and_then(|v| v.as_mapping_mut()) {
                    spec.insert("replicas".into(), (replicas as i64).into());
                }
                if let Some(name) = scheduler_name {
                    if let Some(pod_spec) = doc
                        .get_mut("spec")
                        .and_then(|s| s.get_mut("template"))
                        .and_then(|t| t.get_mut("spec"))
                        .and_then(|v| v.as_mapping_mut())
                    {
                        pod_spec.insert("schedulerName".into(), name.into());
                    }
                }
            }
        }
    }

    fn set_label(doc: &mut serde_yaml::Value, key: &str, value: &str) {
        let Some(mapping) = doc.as_mapping_mut() else {
            return;
        };
        let metadata = mapping
            .entry("metadata".into())
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        let Some(metadata) = metadata.as_mapping_mut() else {
            return;
        };
        let labels = metadata
            .entry("labels".into())
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        if let Some(labels) = labels.as_mapping_mut() {
            labels.insert(key.into(), value.into());
        }
    }

    /// Containers declared under the Deployment's pod template spec.
    pub fn containers(&self) -> Vec<ContainerSpec> {
        let Some(deployment) = self.deployment_doc() else {
            return Vec::new();
        };
        let containers = deployment
            .get("spec")
            .and_then(|s| s.get("template"))
            .and_then(|t| t.get("spec"))
            .and_then(|s| s.get("containers"))
            .and_then(|c| c.as_sequence());

        let Some(containers) = containers else {
            return Vec::new();
        };

        containers
            .iter()
            .map(|c| ContainerSpec {
                name: str_field(c, "name").unwrap_or_default(),
                image: str_field(c, "image").unwrap_or_default(),
                command: str_seq_field(c, "command"),
                args: str_seq_field(c, "args"),
                ports: c
                    .get("ports")
                    .and_then(|p| p.as_sequence())
                    .map(|seq| {
                        seq.iter()
                            .filter_map(|p| p.get("containerPort").and_then(|v| v.as_u64()))
                            .map(|v| v as u16)
                            .collect()
                    })
                    .unwrap_or_default(),
                volume_mounts: c
                    .get("volumeMounts")
                    .and_then(|v| v.as_sequence())
                    .map(|seq| {
                        seq.iter()
                            .filter_map(|m| {
                                Some((str_field(m, "name")?, str_field(m, "mountPath")?))
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// `emptyDir` volumes declared on the pod template: volume name -> host
    /// path, `None` meaning "needs a fresh temp directory" (the Docker
    /// back-end fills these in at deploy time).
    pub fn empty_dir_volumes(&self) -> HashMap<String, Option<String>> {
        let Some(deployment) = self.deployment_doc() else {
            return HashMap::new();
        };
        let volumes = deployment
            .get("spec")
            .and_then(|s| s.get("template"))
            .and_then(|t| t.get("spec"))
            .and_then(|s| s.get("volumes"))
            .and_then(|v| v.as_sequence());

        let Some(volumes) = volumes else {
            return HashMap::new();
        };

        volumes
            .iter()
            .filter_map(|v| {
                if v.get("emptyDir").is_some() {
                    Some((str_field(v, "name")?, None))
                } else {
                    None
                }
            })
            .collect()
    }
}

fn str_field(v: &serde_yaml::Value, key: &str) -> Option<String> {
    v.get(key)?.as_str().map(str::to_owned)
}

fn str_seq_field(v: &serde_yaml::Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|c| c.as_sequence())
        .map(|seq| seq.iter().filter_map(|s| s.as_str().map(str::to_owned)).collect())
        .unwrap_or_default()
}
