//! User input union and its mapping to the subprocess submit shape.

use serde::{Deserialize, Serialize};

/// One entry of the `input` array on `turn/start` / `turn/steer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UserInput {
    /// Plain prompt text.
    #[serde(rename = "text")]
    Text { text: String },

    /// Remote or data-URL image.
    #[serde(rename = "image")]
    Image { url: String },

    /// Image already on the local filesystem.
    #[serde(rename = "localImage")]
    LocalImage { path: String },

    /// A named skill invocation, inlined into the prompt.
    #[serde(rename = "skill")]
    Skill { name: String, content: String },

    /// An @-mention of a workspace path.
    #[serde(rename = "mention")]
    Mention { path: String },

    /// File contents pasted by the UI; the path is what the agent receives.
    #[serde(rename = "fileContent")]
    FileContent {
        path: String,
        #[serde(default)]
        content: Option<String>,
    },

    /// A plain file attachment by path.
    #[serde(rename = "file")]
    File { path: String },
}

/// The flattened shape handed to `AgentClient::submit`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnPayload {
    pub prompt: String,
    pub images: Vec<String>,
    pub files: Vec<String>,
}

impl TurnPayload {
    /// Flatten a `turn/start` input array.
    ///
    /// Text entries are newline-joined into the prompt; skills inline as
    /// `[skill:<name>] <content>`; image URLs go to `images`; local paths of
    /// mention/file/fileContent go to `files`.
    pub fn from_inputs(inputs: &[UserInput]) -> Self {
        let mut prompt_parts: Vec<String> = Vec::new();
        let mut images = Vec::new();
        let mut files = Vec::new();

        for input in inputs {
            match input {
                UserInput::Text { text } => prompt_parts.push(text.clone()),
                UserInput::Skill { name, content } => {
                    prompt_parts.push(format!("[skill:{name}] {content}"));
                }
                UserInput::Image { url } => images.push(url.clone()),
                UserInput::LocalImage { path } => images.push(path.clone()),
                UserInput::Mention { path }
                | UserInput::File { path }
                | UserInput::FileContent { path, .. } => files.push(path.clone()),
            }
        }

        Self {
            prompt: prompt_parts.join("\n"),
            images,
            files,
        }
    }

    /// True when there is nothing to submit.
    pub fn is_empty(&self) -> bool {
        self.prompt.is_empty() && self.images.is_empty() && self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_entries_newline_joined() {
        let payload = TurnPayload::from_inputs(&[
            UserInput::Text {
                text: "first".into(),
            },
            UserInput::Text {
                text: "second".into(),
            },
        ]);
        assert_eq!(payload.prompt, "first\nsecond");
        assert!(payload.images.is_empty());
        assert!(payload.files.is_empty());
    }

    #[test]
    fn skill_inlines_into_prompt() {
        let payload = TurnPayload::from_inputs(&[
            UserInput::Text { text: "do it".into() },
            UserInput::Skill {
                name: "review".into(),
                content: "focus on tests".into(),
            },
        ]);
        assert_eq!(payload.prompt, "do it\n[skill:review] focus on tests");
    }

    #[test]
    fn images_and_files_routed() {
        let payload = TurnPayload::from_inputs(&[
            UserInput::Image {
                url: "https://example.com/a.png".into(),
            },
            UserInput::LocalImage {
                path: "/tmp/b.png".into(),
            },
            UserInput::Mention {
                path: "src/main.rs".into(),
            },
            UserInput::File {
                path: "README.md".into(),
            },
            UserInput::FileContent {
                path: "notes.txt".into(),
                content: Some("hello".into()),
            },
        ]);
        assert_eq!(
            payload.images,
            vec!["https://example.com/a.png", "/tmp/b.png"]
        );
        assert_eq!(payload.files, vec!["src/main.rs", "README.md", "notes.txt"]);
        assert!(payload.prompt.is_empty());
    }

    #[test]
    fn tagged_json_parses() {
        let inputs: Vec<UserInput> = serde_json::from_str(
            r#"[{"type":"text","text":"hello"},{"type":"file","path":"x.rs"}]"#,
        )
        .unwrap();
        let payload = TurnPayload::from_inputs(&inputs);
        assert_eq!(payload.prompt, "hello");
        assert_eq!(payload.files, vec!["x.rs"]);
    }

    #[test]
    fn empty_input_is_empty_payload() {
        assert!(TurnPayload::from_inputs(&[]).is_empty());
    }
}
