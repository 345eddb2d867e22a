//! RunningHub 工作流客户端
//!
//! 封装五个 openapi 端点：上传、提交、查状态、取结果、取消，
//! 外加结果文件下载。全部是单次请求/响应，不做重试。
//!
//! 提交的"队列已满"判别只在 `submit` 一处：`code != 0` 且
//! `msg == "TASK_QUEUE_MAXED"` 视为 `SubmitReply::Busy`，其余非零
//! code 一律是 `BadResponse` 错误。

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;

use crate::config::Config;
use crate::error::{PipelineError, Result};

/// 队列已满的标记消息
const QUEUE_MAXED_MSG: &str = "TASK_QUEUE_MAXED";

/// 工作流输入槽位
///
/// 对应 nodeInfoList 里的一项：某个节点的某个字段填某个值。
#[derive(Debug, Clone)]
pub struct NodeSlot {
    pub node_id: &'static str,
    pub field_name: &'static str,
    pub field_value: String,
    pub description: &'static str,
}

impl NodeSlot {
    /// 发型参考图槽位（节点 238）
    pub fn hairstyle(file_name: impl Into<String>) -> Self {
        Self {
            node_id: "238",
            field_name: "image",
            field_value: file_name.into(),
            description: "hair",
        }
    }

    /// 用户照片槽位（节点 239）
    pub fn user(file_name: impl Into<String>) -> Self {
        Self {
            node_id: "239",
            field_name: "image",
            field_value: file_name.into(),
            description: "usr",
        }
    }
}

/// 任务提交结果
#[derive(Debug, Clone)]
pub enum SubmitReply {
    /// 提交成功，返回任务 ID
    Submitted(String),
    /// 远端任务队列已满（可重试的业务结果，不是错误）
    Busy,
}

/// 远端任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn parse(raw: &str) -> TaskStatus {
        match raw {
            "QUEUED" | "CREATE" => TaskStatus::Queued,
            "SUCCESS" => TaskStatus::Success,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            // 其余状态（RUNNING 等）都按运行中处理，继续轮询
            _ => TaskStatus::Running,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// 一个任务产出文件
#[derive(Debug, Clone, Deserialize)]
pub struct TaskOutput {
    /// 可下载的文件地址
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    /// 文件类型
    #[serde(rename = "fileType", default)]
    pub file_type: String,
    /// 远端处理耗时（秒）
    #[serde(rename = "taskCostTime", default)]
    pub cost_time: Option<f64>,
}

/// 工作流客户端接口
///
/// 纯 I/O：传输失败原样上抛为 `Transport`，不吞不重试。
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// 上传本地图片，返回远端文件名
    async fn upload(&self, image_path: &Path) -> Result<String>;

    /// 提交工作流任务
    async fn submit(&self, slots: &[NodeSlot]) -> Result<SubmitReply>;

    /// 查询任务状态
    async fn poll(&self, task_id: &str) -> Result<TaskStatus>;

    /// 获取任务产出（仅在状态为 SUCCESS 后有效）
    async fn fetch(&self, task_id: &str) -> Result<Vec<TaskOutput>>;

    /// 取消任务，返回远端是否确认取消
    async fn cancel(&self, task_id: &str) -> Result<bool>;

    /// 下载一个结果文件到本地
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// RunningHub openapi 客户端
pub struct RunningHubClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    webapp_id: String,
}

impl RunningHubClient {
    /// 从配置创建客户端
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.runninghub_base_url.clone(),
            api_key: config.runninghub_api_key.clone(),
            webapp_id: config.runninghub_webapp_id.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/task/openapi/{}", self.base_url, path)
    }

    /// 发一个携带 apiKey + taskId 的 JSON 请求，返回整包响应
    async fn post_task_op(&self, path: &str, task_id: &str) -> Result<Value> {
        let endpoint = self.endpoint(path);
        let body = json!({ "apiKey": self.api_key, "taskId": task_id });

        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        response
            .json()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))
    }

    fn response_code(result: &Value) -> Option<i64> {
        result.get("code").and_then(|v| v.as_i64())
    }

    fn response_msg(result: &Value) -> Option<String> {
        result
            .get("msg")
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn bad_response(endpoint: String, result: &Value) -> PipelineError {
        PipelineError::BadResponse {
            endpoint,
            code: Self::response_code(result),
            message: Self::response_msg(result),
        }
    }
}

#[async_trait]
impl WorkflowClient for RunningHubClient {
    async fn upload(&self, image_path: &Path) -> Result<String> {
        let endpoint = self.endpoint("upload");
        let path_str = image_path.display().to_string();

        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| PipelineError::io(&path_str, e))?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.jpg".to_string());

        debug!("上传图片: {} ({} 字节)", file_name, bytes.len());

        let form = reqwest::multipart::Form::new()
            .text("apiKey", self.api_key.clone())
            .text("fileType", "image")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        if Self::response_code(&result) != Some(0) {
            return Err(Self::bad_response(endpoint, &result));
        }

        result
            .pointer("/data/fileName")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Self::bad_response(endpoint, &result))
    }

    async fn submit(&self, slots: &[NodeSlot]) -> Result<SubmitReply> {
        let endpoint = self.endpoint("ai-app/run");

        let node_info_list: Vec<Value> = slots
            .iter()
            .map(|slot| {
                json!({
                    "nodeId": slot.node_id,
                    "fieldName": slot.field_name,
                    "fieldValue": slot.field_value,
                    "description": slot.description,
                })
            })
            .collect();

        let body = json!({
            "webappId": self.webapp_id,
            "apiKey": self.api_key,
            "nodeInfoList": node_info_list,
        });

        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::transport(&endpoint, e))?;

        if Self::response_code(&result) == Some(0) {
            let task_id = result
                .pointer("/data/taskId")
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| Self::bad_response(endpoint.clone(), &result))?;
            debug!("任务提交成功: {}", task_id);
            return Ok(SubmitReply::Submitted(task_id));
        }

        // 唯一的队列已满判别点
        if Self::response_msg(&result).as_deref() == Some(QUEUE_MAXED_MSG) {
            return Ok(SubmitReply::Busy);
        }

        Err(Self::bad_response(endpoint, &result))
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus> {
        let endpoint = self.endpoint("status");
        let result = self.post_task_op("status", task_id).await?;

        if Self::response_code(&result) != Some(0) {
            return Err(Self::bad_response(endpoint, &result));
        }

        let raw = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Self::bad_response(endpoint, &result))?;

        Ok(TaskStatus::parse(raw))
    }

    async fn fetch(&self, task_id: &str) -> Result<Vec<TaskOutput>> {
        let endpoint = self.endpoint("outputs");
        let result = self.post_task_op("outputs", task_id).await?;

        if Self::response_code(&result) != Some(0) {
            return Err(Self::bad_response(endpoint, &result));
        }

        let data = result
            .get("data")
            .cloned()
            .ok_or_else(|| Self::bad_response(endpoint, &result))?;

        let outputs: Vec<TaskOutput> = serde_json::from_value(data)?;
        Ok(outputs)
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        let result = self.post_task_op("cancel", task_id).await?;
        Ok(Self::response_code(&result) == Some(0))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::transport(url, e))?;

        if !response.status().is_success() {
            return Err(PipelineError::BadResponse {
                endpoint: url.to_string(),
                code: Some(response.status().as_u16() as i64),
                message: None,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(url, e))?;

        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| PipelineError::io(dest.display().to_string(), e))?;

        debug!("已下载: {} → {}", url, dest.display());
        Ok(())
    }
}
