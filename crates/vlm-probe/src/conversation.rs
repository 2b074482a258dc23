/*
    Structured chat input rendered into the raw prompt expected by the model, through the
    Jinja2 chat template shipped with the model (or a configured override).
*/

use minijinja::{context, AutoEscape, Environment};
use serde::Serialize;

/// ChatML template with the image placeholders in front of the text of each turn.
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message['role'] }}\n{% for line in message['content'] %}{% if line['type'] == 'image' %}<image>\n{% endif %}{% endfor %}{% for line in message['content'] %}{% if line['type'] == 'text' %}{{ line['text'] }}{% endif %}{% endfor %}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,      // prompt
    Assistant, // the model's response
    System,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Text { text: String },
    Image,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Line>,
}

/// An ordered sequence of chat turns.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A single user turn holding the question followed by one image placeholder.
    pub fn single_turn(question: impl Into<String>) -> Self {
        Self {
            messages: vec![Message {
                role: Role::User,
                content: vec![
                    Line::Text {
                        text: question.into(),
                    },
                    Line::Image,
                ],
            }],
        }
    }

    /// Number of image placeholders across all turns.
    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|line| matches!(line, Line::Image))
            .count()
    }
}

/// A compiled chat template.
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();

        // plain text prompt, not HTML
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template_owned("chat", template.into())?;

        Ok(Self { env })
    }

    /// Render the conversation, optionally opening the assistant turn at the end.
    pub fn render(
        &self,
        conversation: &Conversation,
        add_generation_prompt: bool,
    ) -> Result<String, minijinja::Error> {
        let template = self.env.get_template("chat")?;
        template.render(context! {
            messages => &conversation.messages,
            add_generation_prompt => add_generation_prompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_turn_chatml() -> Result<(), minijinja::Error> {
        let template = ChatTemplate::new(CHATML_TEMPLATE)?;
        let conversation = Conversation::single_turn("What do you see?");

        assert_eq!(conversation.image_count(), 1);
        assert_eq!(
            template.render(&conversation, true)?,
            "<|im_start|>user\n<image>\nWhat do you see?<|im_end|>\n<|im_start|>assistant\n"
        );
        assert_eq!(
            template.render(&conversation, false)?,
            "<|im_start|>user\n<image>\nWhat do you see?<|im_end|>\n"
        );
        Ok(())
    }

    #[test]
    fn test_multi_turn_chatml() -> Result<(), minijinja::Error> {
        let template = ChatTemplate::new(CHATML_TEMPLATE)?;
        let mut conversation = Conversation::single_turn("Describe the image.");
        conversation.messages.push(Message {
            role: Role::Assistant,
            content: vec![Line::Text {
                text: "A dot.".to_string(),
            }],
        });
        conversation.messages.push(Message {
            role: Role::User,
            content: vec![Line::Text {
                text: "What color?".to_string(),
            }],
        });

        assert_eq!(
            template.render(&conversation, true)?,
            "<|im_start|>user\n<image>\nDescribe the image.<|im_end|>\n<|im_start|>assistant\nA dot.<|im_end|>\n<|im_start|>user\nWhat color?<|im_end|>\n<|im_start|>assistant\n"
        );
        Ok(())
    }

    #[test]
    fn test_custom_template_is_not_escaped() -> Result<(), minijinja::Error> {
        let template = ChatTemplate::new(
            "{% for message in messages %}{% for line in message['content'] %}{% if line['type'] == 'text' %}{{ line['text'] }}{% endif %}{% endfor %}{% endfor %}",
        )?;
        let conversation = Conversation::single_turn("<b> & \"q\"");
        assert_eq!(template.render(&conversation, true)?, "<b> & \"q\"");
        Ok(())
    }

    #[test]
    fn test_invalid_template() {
        assert!(ChatTemplate::new("{% for x in %}").is_err());
    }
}
