use std::collections::HashMap;

use experiment_core::entity::{Content, ContentType, Message};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

lazy_static! {
    static ref PLACEHOLDER: Regex = {
        #[expect(clippy::expect_used)]
        Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("Failed to compile placeholder regex")
    };
}

/// Substitutes `{{key}}` placeholders in one pass: substituted values are never rescanned, and
/// unknown keys render as the empty string.
pub fn render_text(template: &str, variables: &HashMap<String, Content>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.to_template_string(),
            None => String::new(),
        })
        .into_owned()
}

/// Renders a message's content. Multipart content is rendered part by part; a
/// `MultiPartVariable` part is replaced by the parts of the named input.
pub fn render_content(content: &Content, variables: &HashMap<String, Content>) -> Content {
    match content.content_type {
        ContentType::Text => Content {
            text: content.text.as_deref().map(|t| render_text(t, variables)),
            ..content.clone()
        },
        ContentType::MultiPart => {
            let mut parts = Vec::new();
            for part in content.multi_part.iter().flatten() {
                if part.content_type == ContentType::MultiPartVariable {
                    splice_variable(part, variables, &mut parts);
                } else {
                    parts.push(render_content(part, variables));
                }
            }
            Content {
                multi_part: Some(parts),
                ..content.clone()
            }
        }
        ContentType::MultiPartVariable => {
            let mut parts = Vec::new();
            splice_variable(content, variables, &mut parts);
            Content::multi_part(parts)
        }
        ContentType::Image | ContentType::Audio => content.clone(),
    }
}

fn splice_variable(
    placeholder: &Content,
    variables: &HashMap<String, Content>,
    parts: &mut Vec<Content>,
) {
    let Some(value) = placeholder
        .text
        .as_deref()
        .and_then(|name| variables.get(name))
    else {
        return;
    };
    match (&value.content_type, &value.multi_part) {
        (ContentType::MultiPart, Some(inner)) => parts.extend(inner.iter().cloned()),
        _ => parts.push(value.clone()),
    }
}

/// Renders every message, then appends `suffix` to the first one.
pub fn render_messages(
    messages: &[Message],
    variables: &HashMap<String, Content>,
    suffix: &str,
) -> Vec<Message> {
    let mut rendered: Vec<Message> = messages
        .iter()
        .map(|message| Message {
            content: message
                .content
                .as_ref()
                .map(|c| render_content(c, variables)),
            ..message.clone()
        })
        .collect();
    if suffix.is_empty() {
        return rendered;
    }
    if let Some(first) = rendered.first_mut() {
        append_suffix(first, suffix);
    }
    rendered
}

fn append_suffix(message: &mut Message, suffix: &str) {
    let content = message
        .content
        .get_or_insert_with(|| Content::text(String::new()));
    match content.content_type {
        ContentType::MultiPart => content
            .multi_part
            .get_or_insert_with(Vec::new)
            .push(Content::text(suffix)),
        _ => content.text.get_or_insert_with(String::new).push_str(suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_core::entity::{Image, Role};

    fn vars(pairs: &[(&str, Content)]) -> HashMap<String, Content> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_single_pass_substitution() {
        let variables = vars(&[
            ("input", Content::text("{{output}}")),
            ("output", Content::text("42")),
        ]);
        assert_eq!(
            render_text("Q: {{input}} A: {{ output }} X: {{missing}}", &variables),
            "Q: {{output}} A: 42 X: "
        );
    }

    #[test]
    fn test_missing_key_renders_empty() {
        assert_eq!(render_text("A:{{missing}}:B", &HashMap::new()), "A::B");
    }

    #[test]
    fn test_multipart_variable_splices_parts() {
        let image = Content {
            content_type: ContentType::Image,
            image: Some(Image {
                url: Some("https://example.com/cat.png".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let variables = vars(&[
            (
                "photos",
                Content::multi_part(vec![image.clone(), Content::text("caption")]),
            ),
            ("question", Content::text("What animal?")),
        ]);
        let template = Content::multi_part(vec![
            Content::text("Look: {{question}}"),
            Content::multi_part_variable("photos"),
            Content::multi_part_variable("absent"),
        ]);

        let rendered = render_content(&template, &variables);
        let parts = rendered.multi_part.unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].text.as_deref(), Some("Look: What animal?"));
        assert_eq!(parts[1], image);
        assert_eq!(parts[2].text.as_deref(), Some("caption"));
    }

    #[test]
    fn test_suffix_only_on_first_message() {
        let messages = vec![
            Message::new(Role::System, Content::text("Judge {{answer}}.")),
            Message::new(Role::User, Content::text("{{answer}}")),
        ];
        let variables = vars(&[("answer", Content::text("Paris"))]);
        let rendered = render_messages(&messages, &variables, " Reply in JSON.");
        assert_eq!(
            rendered[0].content.as_ref().and_then(|c| c.text.as_deref()),
            Some("Judge Paris. Reply in JSON.")
        );
        assert_eq!(
            rendered[1].content.as_ref().and_then(|c| c.text.as_deref()),
            Some("Paris")
        );
    }
}
