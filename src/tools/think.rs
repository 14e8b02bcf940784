//! 内部推理工具：thoughts 丢弃，conclusions 保留

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Internal reasoning - thoughts discarded, conclusions kept"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "thoughts": { "type": "string", "description": "Internal reasoning (discarded)" },
                "conclusions": { "type": "string", "description": "Final conclusions (returned)" }
            },
            "required": ["thoughts", "conclusions"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let conclusions = args
            .get("conclusions")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required field: conclusions".to_string())?;
        Ok(json!({ "conclusions": conclusions }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_think_keeps_conclusions_only() {
        let runtime = Runtime::new_in_memory(Default::default());
        let ctx = ToolContext {
            task_id: "t1".into(),
            runtime: Arc::clone(&runtime),
        };
        let out = ThinkTool
            .execute(
                json!({ "thoughts": "long rambling", "conclusions": "do X" }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out, json!({ "conclusions": "do X" }));

        let err = ThinkTool.execute(json!({ "thoughts": "only" }), &ctx).await;
        assert!(err.is_err());
    }
}
