//! 拦截钩子：在每次 send / publish / 响应前观察或改写消息
//!
//! 钩子列表随 RuntimeOptions 传入，生命周期与运行时实例绑定（无全局单例，多个运行时互不干扰）。
//! 返回 Drop 时该次投递按空操作完成：send 得到 Ok(None)，publish 不投递任何订阅者。

use crate::runtime::{AgentId, Payload, TopicId};

/// 钩子对消息的处置
#[derive(Debug, Clone, PartialEq)]
pub enum Intervention {
    /// 继续投递（可替换为改写后的 Payload）
    Continue(Payload),
    /// 丢弃
    Drop,
}

/// 钩子 trait：三个切面都有透传的默认实现，按需覆盖
pub trait InterventionHandler: Send + Sync {
    fn on_send(&self, payload: Payload, _sender: Option<&AgentId>, _recipient: &AgentId) -> Intervention {
        Intervention::Continue(payload)
    }

    fn on_publish(&self, payload: Payload, _sender: Option<&AgentId>, _topic: &TopicId) -> Intervention {
        Intervention::Continue(payload)
    }

    fn on_response(
        &self,
        payload: Payload,
        _responder: &AgentId,
        _recipient: Option<&AgentId>,
    ) -> Intervention {
        Intervention::Continue(payload)
    }
}

/// 依次执行钩子；任一钩子返回 Drop 即短路
pub(crate) fn apply<F>(
    hooks: &[std::sync::Arc<dyn InterventionHandler>],
    payload: Payload,
    mut f: F,
) -> Option<Payload>
where
    F: FnMut(&dyn InterventionHandler, Payload) -> Intervention,
{
    let mut current = payload;
    for hook in hooks {
        match f(hook.as_ref(), current) {
            Intervention::Continue(next) => current = next,
            Intervention::Drop => return None,
        }
    }
    Some(current)
}

/// 每一跳输出一条结构化审计日志（JSON），不改写消息
#[derive(Debug, Default, Clone)]
pub struct TracingIntervention;

impl TracingIntervention {
    fn audit(hop: &str, payload: &Payload, from: Option<&AgentId>, to: String) {
        let audit = serde_json::json!({
            "event": "message_audit",
            "hop": hop,
            "message_type": payload.message_type(),
            "from": from.map(|id| id.to_string()),
            "to": to,
            "body_preview": body_preview(payload.body()),
        });
        tracing::info!(audit = %audit, "hop");
    }
}

impl InterventionHandler for TracingIntervention {
    fn on_send(&self, payload: Payload, sender: Option<&AgentId>, recipient: &AgentId) -> Intervention {
        Self::audit("send", &payload, sender, recipient.to_string());
        Intervention::Continue(payload)
    }

    fn on_publish(&self, payload: Payload, sender: Option<&AgentId>, topic: &TopicId) -> Intervention {
        Self::audit("publish", &payload, sender, topic.to_string());
        Intervention::Continue(payload)
    }

    fn on_response(
        &self,
        payload: Payload,
        responder: &AgentId,
        recipient: Option<&AgentId>,
    ) -> Intervention {
        let to = recipient.map(|id| id.to_string()).unwrap_or_else(|| "(external)".to_string());
        Self::audit("response", &payload, Some(responder), to);
        Intervention::Continue(payload)
    }
}

fn body_preview(body: &serde_json::Value) -> String {
    let s = body.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
