//! Job input schema.
//!
//! Validation collects every violation instead of stopping at the first one, so a
//! caller can fix a payload in one round trip. `null` counts as absent.

use image::DynamicImage;
use kiln_core::{GenerationRequest, Sampler, MAX_PIXELS};
use serde_json::{Map, Value};

pub const MAX_OUTPUTS: u64 = 9;
pub const MAX_STEPS: u64 = 499;
pub const MAX_GUIDANCE_SCALE: f64 = 20.0;
/// Largest side that still fits the pixel budget next to the smallest other side.
pub const MAX_DIMENSION: u64 = MAX_PIXELS as u64 / 8;

const FIELDS: [&str; 15] = [
    "prompt",
    "negative_prompt",
    "width",
    "height",
    "init_image",
    "mask",
    "prompt_strength",
    "num_outputs",
    "num_inference_steps",
    "guidance_scale",
    "scheduler",
    "seed",
    "lora",
    "lora_scale",
    "nsfw",
];

/// A validated job input with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    /// URL of the seed image.
    pub init_image: Option<String>,
    /// URL or local path of the inpainting mask.
    pub mask: Option<String>,
    pub prompt_strength: Option<f64>,
    pub num_outputs: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub scheduler: Sampler,
    pub seed: Option<u64>,
    pub lora: Option<String>,
    pub lora_scale: f64,
    /// Drop outputs the safety checker flags.
    pub nsfw: bool,
}

impl JobInput {
    pub fn into_request(
        self,
        seed_image: Option<DynamicImage>,
        mask_image: Option<DynamicImage>,
    ) -> GenerationRequest {
        let defaults = GenerationRequest::default();
        GenerationRequest {
            prompt: Some(self.prompt),
            negative_prompt: self.negative_prompt,
            width: self.width,
            height: self.height,
            seed_image,
            mask_image,
            strength: self.prompt_strength.unwrap_or(defaults.strength),
            output_count: self.num_outputs,
            step_count: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            sampler_name: self.scheduler.to_string(),
            seed: self.seed,
            adapter: self.lora,
            adapter_scale: self.lora_scale,
        }
    }
}

struct Fields<'a> {
    map: &'a Map<String, Value>,
    errors: Vec<String>,
}

impl<'a> Fields<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|value| !value.is_null())
    }

    fn fail(&mut self, message: String) {
        self.errors.push(message);
    }

    fn check(&mut self, ok: bool, message: impl FnOnce() -> String) {
        if !ok {
            self.fail(message());
        }
    }

    fn string(&mut self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(value) => Some(value.clone()),
            _ => {
                self.fail(format!("`{name}` must be a string"));
                None
            }
        }
    }

    fn integer(&mut self, name: &str) -> Option<u64> {
        let value = self.get(name)?.as_u64();
        if value.is_none() {
            self.fail(format!("`{name}` must be a non-negative integer"));
        }
        value
    }

    fn float(&mut self, name: &str) -> Option<f64> {
        let value = self.get(name)?.as_f64();
        if value.is_none() {
            self.fail(format!("`{name}` must be a number"));
        }
        value
    }

    fn boolean(&mut self, name: &str) -> Option<bool> {
        let value = self.get(name)?.as_bool();
        if value.is_none() {
            self.fail(format!("`{name}` must be a boolean"));
        }
        value
    }

    /// Report a missing field. Fields that are present but malformed were already
    /// reported by their accessor.
    fn required<T>(&mut self, name: &str, value: Option<T>) -> Option<T> {
        if self.get(name).is_none() {
            self.fail(format!("`{name}` is required"));
        }
        value
    }

    fn dimension(&mut self, name: &str) -> usize {
        let value = self.integer(name).unwrap_or(512);
        self.check(value > 0 && value % 8 == 0, || {
            format!("`{name}` must be a positive multiple of 8, got {value}")
        });
        self.check(value <= MAX_DIMENSION, || {
            format!("`{name}` must be at most {MAX_DIMENSION}, got {value}")
        });
        value.min(MAX_DIMENSION) as usize
    }
}

pub fn validate(input: &Value) -> Result<JobInput, Vec<String>> {
    let Some(map) = input.as_object() else {
        return Err(vec!["input must be a JSON object".to_string()]);
    };
    let mut fields = Fields {
        map,
        errors: Vec::new(),
    };

    for key in map.keys() {
        if !FIELDS.contains(&key.as_str()) {
            fields.fail(format!("unexpected field `{key}`"));
        }
    }

    let prompt = fields.string("prompt");
    let prompt = fields.required("prompt", prompt);
    let negative_prompt = fields.string("negative_prompt");

    let width = fields.dimension("width");
    let height = fields.dimension("height");

    let init_image = fields.string("init_image");
    let mask = fields.string("mask");
    fields.check(mask.is_none() || init_image.is_some(), || {
        "mask was provided without init_image".to_string()
    });

    let prompt_strength = fields.float("prompt_strength");
    if let Some(strength) = prompt_strength {
        fields.check((0.0..=1.0).contains(&strength), || {
            format!("`prompt_strength` must be between 0 and 1, got {strength}")
        });
    } else if init_image.is_some() && fields.get("prompt_strength").is_none() {
        fields.fail("`prompt_strength` is required with `init_image`".to_string());
    }

    let num_outputs = fields.integer("num_outputs").unwrap_or(1);
    fields.check((1..=MAX_OUTPUTS).contains(&num_outputs), || {
        format!("`num_outputs` must be between 1 and {MAX_OUTPUTS}, got {num_outputs}")
    });

    let num_inference_steps = fields.integer("num_inference_steps").unwrap_or(30);
    fields.check((1..=MAX_STEPS).contains(&num_inference_steps), || {
        format!("`num_inference_steps` must be between 1 and {MAX_STEPS}, got {num_inference_steps}")
    });

    let guidance_scale = fields.float("guidance_scale");
    let guidance_scale = fields.required("guidance_scale", guidance_scale);
    if let Some(scale) = guidance_scale {
        fields.check(scale > 0.0 && scale < MAX_GUIDANCE_SCALE, || {
            format!("`guidance_scale` must be above 0 and below {MAX_GUIDANCE_SCALE}, got {scale}")
        });
    }

    let scheduler = match fields.string("scheduler") {
        None if fields.get("scheduler").is_none() => Some(Sampler::default()),
        None => None,
        Some(name) => match name.parse::<Sampler>() {
            Ok(sampler) => Some(sampler),
            Err(_) => {
                let known: Vec<String> = Sampler::ALL.iter().map(Sampler::to_string).collect();
                fields.fail(format!(
                    "`scheduler` must be one of {}, got `{name}`",
                    known.join(", ")
                ));
                None
            }
        },
    };

    let seed = fields.integer("seed");
    let lora = fields.string("lora");
    let lora_scale = fields.float("lora_scale").unwrap_or(1.0);
    let nsfw = fields.boolean("nsfw").unwrap_or(true);

    match (prompt, guidance_scale, scheduler) {
        (Some(prompt), Some(guidance_scale), Some(scheduler)) if fields.errors.is_empty() => {
            Ok(JobInput {
                prompt,
                negative_prompt,
                width,
                height,
                init_image,
                mask,
                prompt_strength,
                num_outputs: num_outputs as usize,
                num_inference_steps: num_inference_steps as usize,
                guidance_scale,
                scheduler,
                seed,
                lora,
                lora_scale,
                nsfw,
            })
        }
        _ => Err(fields.errors),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let input = validate(&json!({"prompt": "a fox", "guidance_scale": 7.5})).unwrap();

        assert_eq!(input.width, 512);
        assert_eq!(input.height, 512);
        assert_eq!(input.num_outputs, 1);
        assert_eq!(input.num_inference_steps, 30);
        assert_eq!(input.scheduler, Sampler::Lms);
        assert_eq!(input.lora_scale, 1.0);
        assert!(input.nsfw);
        assert_eq!(input.seed, None);
        assert_eq!(input.init_image, None);
    }

    #[test]
    fn test_full_input() {
        let input = validate(&json!({
            "prompt": "a fox",
            "negative_prompt": "blurry",
            "width": 768,
            "height": 512,
            "init_image": "https://example.com/fox.png",
            "mask": "https://example.com/mask.png",
            "prompt_strength": 0.6,
            "num_outputs": 4,
            "num_inference_steps": 50,
            "guidance_scale": 9,
            "scheduler": "KLMS",
            "seed": 1234,
            "lora": "someone/ghibli-lora",
            "lora_scale": 0.7,
            "nsfw": false
        }))
        .unwrap();

        assert_eq!(input.scheduler, Sampler::Lms);
        assert_eq!(input.guidance_scale, 9.0);
        assert_eq!(input.prompt_strength, Some(0.6));
        assert_eq!(input.lora.as_deref(), Some("someone/ghibli-lora"));
        assert!(!input.nsfw);

        let request = input.into_request(None, None);
        assert_eq!(request.prompt.as_deref(), Some("a fox"));
        assert_eq!(request.sampler_name, "K-LMS");
        assert_eq!(request.output_count, 4);
        assert_eq!(request.strength, 0.6);
        assert_eq!(request.adapter_scale, 0.7);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let errors = validate(&json!({
            "prompt": "a fox",
            "width": 100,
            "num_outputs": 10,
            "guidance_scale": 25,
            "scheduler": "NOT-A-SAMPLER",
            "style": "ghibli"
        }))
        .unwrap_err();

        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("`style`")));
        assert!(errors.iter().any(|e| e.contains("`width`")));
        assert!(errors.iter().any(|e| e.contains("`num_outputs`")));
        assert!(errors.iter().any(|e| e.contains("`guidance_scale`")));
        assert!(errors.iter().any(|e| e.contains("NOT-A-SAMPLER")));
    }

    #[test]
    fn test_huge_dimensions_are_rejected() {
        let errors = validate(&json!({
            "prompt": "a fox",
            "guidance_scale": 7.5,
            "width": 4294967296u64,
            "height": 4294967296u64
        }))
        .unwrap_err();

        assert_eq!(
            errors,
            vec![
                format!("`width` must be at most {MAX_DIMENSION}, got 4294967296"),
                format!("`height` must be at most {MAX_DIMENSION}, got 4294967296"),
            ]
        );

        let input = validate(&json!({
            "prompt": "a fox",
            "guidance_scale": 7.5,
            "width": MAX_DIMENSION,
            "height": 8
        }))
        .unwrap();
        assert_eq!(input.width * input.height, MAX_PIXELS);
    }

    #[test]
    fn test_required_fields() {
        let errors = validate(&json!({})).unwrap_err();
        assert_eq!(
            errors,
            vec![
                "`prompt` is required".to_string(),
                "`guidance_scale` is required".to_string()
            ]
        );
    }

    #[test]
    fn test_image_dependencies() {
        let errors = validate(&json!({
            "prompt": "a fox",
            "guidance_scale": 7.5,
            "mask": "mask.png"
        }))
        .unwrap_err();
        assert_eq!(errors, vec!["mask was provided without init_image".to_string()]);

        let errors = validate(&json!({
            "prompt": "a fox",
            "guidance_scale": 7.5,
            "init_image": "https://example.com/fox.png"
        }))
        .unwrap_err();
        assert_eq!(
            errors,
            vec!["`prompt_strength` is required with `init_image`".to_string()]
        );
    }

    #[test]
    fn test_wrong_types() {
        let errors = validate(&json!({
            "prompt": 3,
            "guidance_scale": "high",
            "seed": -1,
            "nsfw": "yes"
        }))
        .unwrap_err();

        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.contains(&"`prompt` must be a string".to_string()));
        assert!(errors.contains(&"`seed` must be a non-negative integer".to_string()));
    }

    #[test]
    fn test_null_is_absent() {
        let input = validate(&json!({
            "prompt": "a fox",
            "guidance_scale": 7.5,
            "seed": null,
            "scheduler": null
        }))
        .unwrap();
        assert_eq!(input.seed, None);
        assert_eq!(input.scheduler, Sampler::Lms);
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(
            validate(&json!(["a fox"])).unwrap_err(),
            vec!["input must be a JSON object".to_string()]
        );
    }
}
