use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const REQUEST_SEPARATOR: &str = "\n\n--- USER REQUEST ---\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AspectRatio {
    #[default]
    Square,
    Portrait,
    Landscape,
}

impl AspectRatio {
    pub fn ratio(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Landscape => "16:9",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AspectRatio::Square => "Square",
            AspectRatio::Portrait => "Portrait",
            AspectRatio::Landscape => "Landscape",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" | "1:1" => Ok(AspectRatio::Square),
            "portrait" | "9:16" => Ok(AspectRatio::Portrait),
            "landscape" | "16:9" => Ok(AspectRatio::Landscape),
            other => Err(format!("unknown aspect ratio: {other}")),
        }
    }
}

fn image_verbs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)create|generate|make|draw|edit|change|render|imagine").expect("static regex")
    })
}

/// A request is an image task when images are attached or the text asks to create or edit one.
pub fn is_image_task(text: &str, has_attachments: bool) -> bool {
    has_attachments || image_verbs().is_match(text)
}

pub fn system_preamble(is_image_task: bool, aspect_ratio: AspectRatio, date: NaiveDate) -> String {
    let mut preamble = format!(
        "You are Studio, a multi-talented AI creative assistant. Your primary role is to help users \
         generate and edit stunning visuals. You are also a helpful partner, capable of answering \
         general questions, brainstorming ideas, writing captions for images, and refining user \
         prompts to be more effective. Be friendly, creative, and always aim to be as helpful as \
         possible. For your reference, the current date is {}.",
        date.format("%A, %B %-d, %Y")
    );
    if is_image_task {
        preamble.push_str(&format!(
            " When generating or editing an image, you MUST strictly conform to the user's specified \
             aspect ratio: **{} ({})**.",
            aspect_ratio,
            aspect_ratio.ratio()
        ));
    }
    preamble
}

pub fn default_edit_instruction(aspect_ratio: AspectRatio) -> String {
    format!(
        "Please perform the most logical edit based on the attached image(s). If an aspect ratio is \
         selected ({aspect_ratio}), prioritize resizing the image."
    )
}

pub fn variation_instruction(original_prompt: &str) -> String {
    format!(
        "Generate a stylistic variation of the provided image. Use the original prompt for context \
         and inspiration: \"{original_prompt}\""
    )
}

#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    pub text: &'a str,
    pub aspect_ratio: AspectRatio,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub text: String,
    pub instruction: String,
    pub is_image_task: bool,
}

pub fn compose(req: &ComposeRequest<'_>, date: NaiveDate) -> ComposedPrompt {
    let message = req.text.trim();
    let image_task = is_image_task(message, req.has_attachments);
    let instruction = if message.is_empty() && req.has_attachments {
        default_edit_instruction(req.aspect_ratio)
    } else {
        message.to_string()
    };
    let preamble = system_preamble(image_task, req.aspect_ratio, date);
    ComposedPrompt {
        text: format!("{preamble}{REQUEST_SEPARATOR}{instruction}"),
        instruction,
        is_image_task: image_task,
    }
}

pub fn compose_variation(original_prompt: &str, aspect_ratio: AspectRatio, date: NaiveDate) -> ComposedPrompt {
    let instruction = variation_instruction(original_prompt);
    let preamble = system_preamble(true, aspect_ratio, date);
    ComposedPrompt {
        text: format!("{preamble}{REQUEST_SEPARATOR}{instruction}"),
        instruction,
        is_image_task: true,
    }
}
