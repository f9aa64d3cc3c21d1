//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelo endpoint `v1/messages`. O conteúdo de uma
//! mensagem é uma lista de partes: texto, imagem ou documento (PDF) em base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::invoker::{Attachment, InvocationMode};

/// Corpo da requisição para o endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo no provedor (ex.: "claude-sonnet-4-5-20250929").
    pub model: String,
    /// Número máximo de tokens na resposta gerada.
    pub max_tokens: u32,
    /// Instrução de sistema opcional; omitida do JSON quando ausente.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

/// Uma única mensagem da conversa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Mensagem do usuário: o anexo (se houver) vem antes do texto do prompt.
    pub fn user(prompt: &str, mode: InvocationMode, attachment: Option<&Attachment>) -> Self {
        let mut content = Vec::with_capacity(2);
        if let Some(attachment) = attachment {
            let source = BlobSource::base64(attachment);
            match mode {
                InvocationMode::Image => content.push(ContentPart::Image { source }),
                InvocationMode::Document | InvocationMode::Text => {
                    content.push(ContentPart::Document { source })
                }
            }
        }
        content.push(ContentPart::Text {
            text: prompt.to_string(),
        });
        Self {
            role: "user".into(),
            content,
        }
    }
}

/// Parte do conteúdo de uma mensagem. Serializada com o campo `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: BlobSource },
    Document { source: BlobSource },
}

/// Dados binários embutidos na requisição.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobSource {
    /// Sempre "base64".
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl BlobSource {
    pub fn base64(attachment: &Attachment) -> Self {
        Self {
            source_type: "base64".into(),
            media_type: attachment.media_type.clone(),
            data: STANDARD.encode(&attachment.data),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    /// Blocos de conteúdo gerados.
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// Motivo da parada (ex.: "end_turn", "max_tokens"). `None` se ausente.
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena os blocos de texto, ignorando os demais tipos.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Um bloco de conteúdo da resposta.
///
/// Blocos que não são texto (ex.: `tool_use`) chegam sem o campo `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_omits_system_and_attachments() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5-20250929".into(),
            max_tokens: 4096,
            system: None,
            messages: vec![Message::user("Hello", InvocationMode::Text, None)],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["messages"][0]["content"][0]["text"], "Hello");
    }

    #[test]
    fn image_attachment_is_base64_encoded_before_prompt() {
        let attachment = Attachment {
            media_type: "image/png".into(),
            data: vec![0x89, b'P', b'N', b'G'],
        };
        let message = Message::user("Translate", InvocationMode::Image, Some(&attachment));
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["content"][0]["type"], "image");
        assert_eq!(json["content"][0]["source"]["type"], "base64");
        assert_eq!(json["content"][0]["source"]["media_type"], "image/png");
        assert_eq!(json["content"][0]["source"]["data"], "iVBORw==");
        assert_eq!(json["content"][1]["type"], "text");
    }

    #[test]
    fn pdf_attachment_becomes_document_part() {
        let attachment = Attachment {
            media_type: "application/pdf".into(),
            data: b"%PDF-1.7".to_vec(),
        };
        let message = Message::user("Translate", InvocationMode::Document, Some(&attachment));
        assert!(matches!(message.content[0], ContentPart::Document { .. }));
        assert_eq!(message.content.len(), 2);
    }

    #[test]
    fn response_text_joins_text_blocks_only() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "Bonjour "},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": "le monde"}
            ],
            "model": "claude-sonnet-4-5-20250929",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.text(), "Bonjour le monde");
        assert_eq!(resp.usage.output_tokens, 15);
    }

    #[test]
    fn null_stop_reason_is_accepted() {
        let json = r#"{
            "id": "msg_456",
            "content": [],
            "model": "test",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.stop_reason, None);
        assert_eq!(resp.text(), "");
    }
}
