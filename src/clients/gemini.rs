//! Gemini 图像预处理客户端
//!
//! 走 OpenRouter 的 chat/completions 接口，图片以 data URL 内联，
//! 按图片类型选择不同的提示语。响应里的生成图在 OpenRouter 扩展字段
//! `message.images[0].image_url.url` 中，同样是 data URL。
//!
//! "响应中没有图片"是合法结果（`PreprocessReply::NoImage`），
//! 不是错误；是否重试由上层决定。

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::{PipelineError, Result};

/// 图片类型，决定预处理使用的提示语
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// 用户照片
    User,
    /// 发型参考图
    Hairstyle,
}

impl ImageKind {
    /// 类型对应的预处理提示语
    pub fn prompt(&self) -> &'static str {
        match self {
            ImageKind::User => {
                "保持人物一致性，保持服饰和发型不变，身材不要太胖，改为半身证件照，光线充足，露出黑色腰带。"
            }
            ImageKind::Hairstyle => {
                "保持人物一致性，保持服饰和发型发色不变，保持发型纹理清晰，光照条件与原图一致，改为半身证件照，露出黑色腰带。"
            }
        }
    }

    /// 日志显示名
    pub fn label(&self) -> &'static str {
        match self {
            ImageKind::User => "用户",
            ImageKind::Hairstyle => "发型",
        }
    }
}

/// 预处理调用的结果
#[derive(Debug, Clone)]
pub enum PreprocessReply {
    /// 模型返回了生成图（已解码的字节）
    Image(Vec<u8>),
    /// 响应合法但没有图片产出
    NoImage,
}

/// 预处理客户端接口
///
/// 单次请求/响应，不含重试；测试时用桩实现替换。
#[async_trait]
pub trait PreprocessClient: Send + Sync {
    /// 对一张图做一次预处理调用
    async fn preprocess(&self, image_bytes: &[u8], kind: ImageKind) -> Result<PreprocessReply>;
}

/// OpenRouter Gemini 客户端
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model_name: String,
}

impl GeminiClient {
    /// 从配置创建客户端
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.openrouter_base_url.clone(),
            api_key: config.openrouter_api_key.clone(),
            model_name: config.gemini_model_name.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// 从响应中提取生成图
    ///
    /// OpenRouter 把生成图放在 `choices[0].message.images` 里，
    /// URL 是 `data:image/...;base64,` 开头的 data URL。
    fn extract_image(response: &Value) -> Result<PreprocessReply> {
        let image_url = response
            .pointer("/choices/0/message/images/0/image_url/url")
            .and_then(|v| v.as_str());

        let Some(url) = image_url else {
            return Ok(PreprocessReply::NoImage);
        };

        if !url.starts_with("data:image/") {
            // 非 base64 格式的 URL，按无产出处理
            debug!("预处理返回了非 data URL 的图片地址，按无产出处理");
            return Ok(PreprocessReply::NoImage);
        }

        let Some((_, base64_part)) = url.split_once(',') else {
            return Ok(PreprocessReply::NoImage);
        };

        match BASE64.decode(base64_part) {
            Ok(bytes) => Ok(PreprocessReply::Image(bytes)),
            Err(e) => {
                debug!("生成图 base64 解码失败，按无产出处理: {}", e);
                Ok(PreprocessReply::NoImage)
            }
        }
    }
}

#[async_trait]
impl PreprocessClient for GeminiClient {
    async fn preprocess(&self, image_bytes: &[u8], kind: ImageKind) -> Result<PreprocessReply> {
        let endpoint = self.endpoint();
        debug!(
            "调用 Gemini 预处理，模型: {}，类型: {}，图片 {} 字节",
            self.model_name,
            kind.label(),
            image_bytes.len()
        );

        let base64_image = BASE64.encode(image_bytes);
        let body = json!({
            "model": self.model_name,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": kind.prompt() },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", base64_image) }
                    }
                ]
            }]
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        if !response.status().is_success() {
            let code = response.status().as_u16() as i64;
            let message = response.text().await.ok();
            return Err(PipelineError::BadResponse {
                endpoint,
                code: Some(code),
                message,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        Self::extract_image(&payload)
    }
}
