use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use crate::error::{RenderError, Result};

/// Upper bound (inclusive) for randomly drawn seeds.
pub const MAX_RANDOM_SEED: i64 = 2_147_483_647;

/// A concrete job description in ComfyUI's API format: node id → node.
///
/// Each node carries a `class_type`, an `inputs` object whose values are
/// either parameters or `[node_id, output_index]` references, and optional
/// `_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGraph(Map<String, Value>);

impl JobGraph {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node ids in the graph, in key order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn node(&self, id: &str) -> Option<&Value> {
        self.0.get(id)
    }

    pub fn operation_type(&self, id: &str) -> Option<&str> {
        self.0.get(id)?.get("class_type")?.as_str()
    }

    pub fn parameter(&self, id: &str, name: &str) -> Option<&Value> {
        self.0.get(id)?.get("inputs")?.get(name)
    }

    /// Edges into `id` as `(input name, source node, output index)`.
    pub fn input_refs(&self, id: &str) -> Vec<(String, String, u64)> {
        let Some(inputs) = self
            .0
            .get(id)
            .and_then(|n| n.get("inputs"))
            .and_then(|i| i.as_object())
        else {
            return Vec::new();
        };
        inputs
            .iter()
            .filter_map(|(name, value)| {
                let pair = value.as_array()?;
                match pair.as_slice() {
                    [Value::String(src), idx] => {
                        Some((name.clone(), src.clone(), idx.as_u64()?))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn set_parameter(&mut self, binding: &LeafBinding, value: Value) -> Result<()> {
        let slot = self
            .0
            .get_mut(&binding.node_id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(|i| i.as_object_mut())
            .and_then(|i| i.get_mut(&binding.input))
            .ok_or_else(|| {
                RenderError::InvalidTemplate(format!(
                    "node {} has no input '{}'",
                    binding.node_id, binding.input
                ))
            })?;
        *slot = value;
        Ok(())
    }
}

/// Location of one substituted leaf: a node id and the input key on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafBinding {
    pub node_id: String,
    pub input: String,
}

impl LeafBinding {
    pub fn new(node_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            input: input.into(),
        }
    }
}

/// The three leaves filled in per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBindings {
    pub image: LeafBinding,
    pub prompt: LeafBinding,
    pub seed: LeafBinding,
}

impl Default for TemplateBindings {
    fn default() -> Self {
        Self {
            image: LeafBinding::new("132", "base64_data"),
            prompt: LeafBinding::new("75:74", "text"),
            seed: LeafBinding::new("75:73", "noise_seed"),
        }
    }
}

/// A validated, immutable job-graph template.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    graph: JobGraph,
    bindings: TemplateBindings,
}

impl WorkflowTemplate {
    /// Validate `graph` against `bindings`.
    pub fn new(graph: Value, bindings: TemplateBindings) -> Result<Self> {
        let Value::Object(nodes) = graph else {
            return Err(RenderError::InvalidTemplate(
                "template must be a JSON object of nodes".into(),
            ));
        };
        if nodes.is_empty() {
            return Err(RenderError::InvalidTemplate("template has no nodes".into()));
        }
        for (id, node) in &nodes {
            let has_class = node.get("class_type").and_then(|v| v.as_str()).is_some();
            let has_inputs = node.get("inputs").map(|v| v.is_object()).unwrap_or(false);
            if !has_class || !has_inputs {
                return Err(RenderError::InvalidTemplate(format!(
                    "node {} needs a class_type and an inputs object",
                    id
                )));
            }
        }
        let graph = JobGraph(nodes);
        for binding in [&bindings.image, &bindings.prompt, &bindings.seed] {
            if graph.parameter(&binding.node_id, &binding.input).is_none() {
                return Err(RenderError::InvalidTemplate(format!(
                    "binding {}.{} does not exist in the template",
                    binding.node_id, binding.input
                )));
            }
        }
        Ok(Self { graph, bindings })
    }

    /// Parse an API-format workflow export.
    pub fn from_json(json: &str, bindings: TemplateBindings) -> Result<Self> {
        let graph: Value = serde_json::from_str(json)
            .map_err(|e| RenderError::InvalidTemplate(format!("not valid JSON: {}", e)))?;
        Self::new(graph, bindings)
    }

    pub fn load(path: &Path, bindings: TemplateBindings) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RenderError::InvalidTemplate(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw, bindings)
    }

    /// The bundled Flux-2 Klein image-to-image graph.
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn bindings(&self) -> &TemplateBindings {
        &self.bindings
    }
}

static BUILTIN: LazyLock<WorkflowTemplate> = LazyLock::new(|| WorkflowTemplate {
    graph: JobGraph(match builtin_graph() {
        Value::Object(nodes) => nodes,
        _ => Map::new(),
    }),
    bindings: TemplateBindings::default(),
});

fn builtin_graph() -> Value {
    json!({
        "9": {
            "class_type": "SaveImage",
            "inputs": {"filename_prefix": "Flux2-Klein", "images": ["75:65", 0]},
            "_meta": {"title": "Save Image"}
        },
        "132": {
            "class_type": "easy loadImageBase64",
            "inputs": {"base64_data": "", "image_output": "Preview", "save_prefix": "ComfyUI"},
            "_meta": {"title": "Load Image (Base64)"}
        },
        "141": {
            "class_type": "DF_Image_scale_to_side",
            "inputs": {
                "side_length": 2048,
                "side": "Height",
                "upscale_method": "nearest-exact",
                "crop": "center",
                "image": ["132", 0]
            },
            "_meta": {"title": "Image scale to side"}
        },
        "143": {
            "class_type": "ImageCrop+",
            "inputs": {
                "width": 2048,
                "height": 2048,
                "position": "center",
                "x_offset": 0,
                "y_offset": 0,
                "image": ["141", 0]
            },
            "_meta": {"title": "Image Crop"}
        },
        "75:61": {
            "class_type": "KSamplerSelect",
            "inputs": {"sampler_name": "euler"},
            "_meta": {"title": "KSamplerSelect"}
        },
        "75:73": {
            "class_type": "RandomNoise",
            "inputs": {"noise_seed": 0},
            "_meta": {"title": "RandomNoise"}
        },
        "75:70": {
            "class_type": "UNETLoader",
            "inputs": {"unet_name": "flux-2-klein-4b-fp8.safetensors", "weight_dtype": "default"},
            "_meta": {"title": "Load Diffusion Model"}
        },
        "75:71": {
            "class_type": "CLIPLoader",
            "inputs": {"clip_name": "qwen_3_4b.safetensors", "type": "flux2", "device": "default"},
            "_meta": {"title": "Load CLIP"}
        },
        "75:72": {
            "class_type": "VAELoader",
            "inputs": {"vae_name": "flux2-vae.safetensors"},
            "_meta": {"title": "Load VAE"}
        },
        "75:74": {
            "class_type": "CLIPTextEncode",
            "inputs": {"text": "", "clip": ["75:71", 0]},
            "_meta": {"title": "CLIP Text Encode (Positive Prompt)"}
        },
        "75:82": {
            "class_type": "ConditioningZeroOut",
            "inputs": {"conditioning": ["75:74", 0]},
            "_meta": {"title": "ConditioningZeroOut"}
        },
        "75:80": {
            "class_type": "ImageScaleToTotalPixels",
            "inputs": {
                "upscale_method": "nearest-exact",
                "megapixels": 1,
                "resolution_steps": 1,
                "image": ["143", 0]
            },
            "_meta": {"title": "ImageScaleToTotalPixels"}
        },
        "75:81": {
            "class_type": "GetImageSize",
            "inputs": {"image": ["75:80", 0]},
            "_meta": {"title": "Get Image Size"}
        },
        "75:79:78": {
            "class_type": "VAEEncode",
            "inputs": {"pixels": ["75:80", 0], "vae": ["75:72", 0]},
            "_meta": {"title": "VAE Encode"}
        },
        "75:62": {
            "class_type": "Flux2Scheduler",
            "inputs": {"steps": 8, "width": ["75:81", 0], "height": ["75:81", 1]},
            "_meta": {"title": "Flux2Scheduler"}
        },
        "75:66": {
            "class_type": "EmptyFlux2LatentImage",
            "inputs": {"width": ["75:81", 0], "height": ["75:81", 1], "batch_size": 1},
            "_meta": {"title": "Empty Flux 2 Latent"}
        },
        "75:79:76": {
            "class_type": "ReferenceLatent",
            "inputs": {"conditioning": ["75:82", 0], "latent": ["75:79:78", 0]},
            "_meta": {"title": "ReferenceLatent"}
        },
        "75:79:77": {
            "class_type": "ReferenceLatent",
            "inputs": {"conditioning": ["75:74", 0], "latent": ["75:79:78", 0]},
            "_meta": {"title": "ReferenceLatent"}
        },
        "75:63": {
            "class_type": "CFGGuider",
            "inputs": {
                "cfg": 1,
                "model": ["75:70", 0],
                "positive": ["75:79:77", 0],
                "negative": ["75:79:76", 0]
            },
            "_meta": {"title": "CFGGuider"}
        },
        "75:64": {
            "class_type": "SamplerCustomAdvanced",
            "inputs": {
                "noise": ["75:73", 0],
                "guider": ["75:63", 0],
                "sampler": ["75:61", 0],
                "sigmas": ["75:62", 0],
                "latent_image": ["75:66", 0]
            },
            "_meta": {"title": "SamplerCustomAdvanced"}
        },
        "75:65": {
            "class_type": "VAEDecode",
            "inputs": {"samples": ["75:64", 0], "vae": ["75:72", 0]},
            "_meta": {"title": "VAE Decode"}
        }
    })
}

/// Renders job graphs from a template.
///
/// The template is shared and never mutated; every build works on its own
/// deep copy, so builds from many tasks don't interfere.
///
/// # Example
/// ```
/// use comfy_render::WorkflowBuilder;
///
/// let builder = WorkflowBuilder::new();
/// let (graph, seed) = builder.build("aGVsbG8=", "a brick villa at dusk", None);
///
/// assert!((0..=comfy_render::workflow::MAX_RANDOM_SEED).contains(&seed));
/// assert_eq!(graph.parameter("75:74", "text").unwrap(), "a brick villa at dusk");
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    template: Arc<WorkflowTemplate>,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowBuilder {
    /// Builder over the built-in template.
    pub fn new() -> Self {
        Self::with_template(WorkflowTemplate::builtin())
    }

    pub fn with_template(template: WorkflowTemplate) -> Self {
        Self {
            template: Arc::new(template),
        }
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    /// Fill the image, prompt and seed leaves into a copy of the template.
    ///
    /// Returns `(graph, actual_seed)`. A `None` or negative seed is replaced
    /// by a fresh uniform draw from `0..=MAX_RANDOM_SEED`.
    pub fn build(&self, image_base64: &str, prompt: &str, seed: Option<i64>) -> (JobGraph, i64) {
        let seed = resolve_seed(seed);
        let mut graph = self.template.graph.clone();
        let bindings = &self.template.bindings;

        // Bindings were checked in WorkflowTemplate::new, so these only fail
        // on a template that bypassed validation.
        for (binding, value) in [
            (&bindings.image, Value::from(image_base64)),
            (&bindings.prompt, Value::from(prompt)),
            (&bindings.seed, Value::from(seed)),
        ] {
            if let Err(e) = graph.set_parameter(binding, value) {
                tracing::error!(error = %e, "Workflow template lost a bound input");
            }
        }

        (graph, seed)
    }
}

fn resolve_seed(seed: Option<i64>) -> i64 {
    match seed {
        Some(s) if s >= 0 => s,
        _ => rand::rng().random_range(0..=MAX_RANDOM_SEED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn ids(graph: &JobGraph) -> BTreeSet<String> {
        graph.node_ids().map(String::from).collect()
    }

    #[test]
    fn test_builtin_template_is_valid() {
        let template = WorkflowTemplate::builtin();
        assert_eq!(template.graph().len(), 21);
        // Re-validating the bundled graph must succeed.
        assert!(WorkflowTemplate::new(
            template.graph().clone().into_value(),
            TemplateBindings::default()
        )
        .is_ok());
    }

    #[test]
    fn test_build_substitutes_three_leaves() {
        let (graph, seed) = WorkflowBuilder::new().build("QUJD", "a glass pavilion", Some(42));
        assert_eq!(seed, 42);
        assert_eq!(graph.parameter("132", "base64_data").unwrap(), "QUJD");
        assert_eq!(graph.parameter("75:74", "text").unwrap(), "a glass pavilion");
        assert_eq!(graph.parameter("75:73", "noise_seed").unwrap(), 42);
    }

    #[test]
    fn test_build_preserves_topology() {
        let template = WorkflowTemplate::builtin();
        let (graph, _) = WorkflowBuilder::new().build("QUJD", "prompt", None);
        assert_eq!(ids(&graph), ids(template.graph()));
        for id in template.graph().node_ids() {
            assert_eq!(graph.operation_type(id), template.graph().operation_type(id));
            assert_eq!(graph.input_refs(id), template.graph().input_refs(id));
        }
    }

    #[test]
    fn test_only_bound_leaves_differ() {
        let template = WorkflowTemplate::builtin();
        let (graph, _) = WorkflowBuilder::new().build("QUJD", "prompt", Some(7));
        let mut changed = Vec::new();
        for id in template.graph().node_ids() {
            let before = template.graph().node(id).unwrap()["inputs"].as_object().unwrap();
            let after = graph.node(id).unwrap()["inputs"].as_object().unwrap();
            for (key, value) in before {
                if after.get(key) != Some(value) {
                    changed.push(format!("{}.{}", id, key));
                }
            }
        }
        changed.sort();
        assert_eq!(changed, vec!["132.base64_data", "75:73.noise_seed", "75:74.text"]);
    }

    #[test]
    fn test_template_is_not_mutated() {
        let builder = WorkflowBuilder::new();
        let _ = builder.build("QUJD", "first", Some(1));
        assert_eq!(builder.template().graph().parameter("75:74", "text").unwrap(), "");
        assert_eq!(
            WorkflowTemplate::builtin().graph().parameter("132", "base64_data").unwrap(),
            ""
        );
    }

    #[test]
    fn test_random_seeds_differ() {
        let builder = WorkflowBuilder::new();
        let (_, a) = builder.build("QUJD", "same", None);
        let (_, b) = builder.build("QUJD", "same", None);
        let (_, c) = builder.build("QUJD", "same", Some(-5));
        assert!((0..=MAX_RANDOM_SEED).contains(&a));
        assert!((0..=MAX_RANDOM_SEED).contains(&c));
        // Collision chance is ~1 in 2^31.
        assert_ne!(a, b);
    }

    #[test]
    fn test_hostile_prompt_stays_valid_json() {
        let prompt = "\"}, \"9\": {\"class_type\": \"Evil\"} \n\t\\ 🏠";
        let (graph, _) = WorkflowBuilder::new().build("QUJD", prompt, Some(1));
        let text = serde_json::to_string(&graph).unwrap();
        let back: JobGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(back.parameter("75:74", "text").unwrap(), prompt);
        assert_eq!(back.operation_type("9"), Some("SaveImage"));
        assert_eq!(back.len(), graph.len());
    }

    #[test]
    fn test_empty_prompt_allowed() {
        let (graph, _) = WorkflowBuilder::new().build("QUJD", "", Some(3));
        assert_eq!(graph.parameter("75:74", "text").unwrap(), "");
    }

    #[test]
    fn test_input_refs() {
        let template = WorkflowTemplate::builtin();
        let mut refs = template.graph().input_refs("75:65");
        refs.sort();
        assert_eq!(
            refs,
            vec![
                ("samples".to_string(), "75:64".to_string(), 0),
                ("vae".to_string(), "75:72".to_string(), 0),
            ]
        );
        assert!(template.graph().input_refs("132").is_empty());
        assert!(template.graph().input_refs("missing").is_empty());
    }

    #[test]
    fn test_custom_template() {
        let json = r#"{
            "1": {"class_type": "LoadImageBase64", "inputs": {"data": ""}},
            "2": {"class_type": "Encode", "inputs": {"prompt": "", "image": ["1", 0]}},
            "3": {"class_type": "Sampler", "inputs": {"seed": 0, "cond": ["2", 0]}}
        }"#;
        let bindings = TemplateBindings {
            image: LeafBinding::new("1", "data"),
            prompt: LeafBinding::new("2", "prompt"),
            seed: LeafBinding::new("3", "seed"),
        };
        let builder =
            WorkflowBuilder::with_template(WorkflowTemplate::from_json(json, bindings).unwrap());
        let (graph, seed) = builder.build("Zm9v", "hello", Some(99));
        assert_eq!(seed, 99);
        assert_eq!(graph.parameter("1", "data").unwrap(), "Zm9v");
        assert_eq!(graph.parameter("2", "prompt").unwrap(), "hello");
        assert_eq!(graph.parameter("3", "seed").unwrap(), 99);
    }

    #[test]
    fn test_template_validation_errors() {
        let defaults = TemplateBindings::default();
        assert!(WorkflowTemplate::from_json("[]", defaults.clone()).is_err());
        assert!(WorkflowTemplate::from_json("{}", defaults.clone()).is_err());
        assert!(WorkflowTemplate::from_json("{ nope", defaults.clone()).is_err());
        assert!(WorkflowTemplate::from_json(
            r#"{"1": {"class_type": "X"}}"#,
            defaults.clone()
        )
        .is_err());

        // Well-formed graph, but the default bindings point at missing nodes.
        let err = WorkflowTemplate::from_json(
            r#"{"1": {"class_type": "X", "inputs": {}}}"#,
            defaults,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::InvalidTemplate(msg) if msg.contains("132")));
    }
}
