use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{Expression, RequestContext};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
struct ExpressionParams {
    set: IndexMap<String, String>,
}

/// Stores evaluated expressions in `vars` for later policies
pub struct ExpressionPolicy {
    assignments: Vec<(String, Expression)>,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: ExpressionParams = parse_params("expression", action)?;
    let assignments = params
        .set
        .into_iter()
        .map(|(var, source)| match Expression::parse(&source) {
            Ok(expression) => Ok((var, expression)),
            Err(e) => Err(invalid_params("expression", format!("{}: {}", var, e))),
        })
        .collect::<gateway_core::Result<Vec<_>>>()?;
    Ok(Arc::new(ExpressionPolicy { assignments }))
}

#[async_trait::async_trait]
impl Policy for ExpressionPolicy {
    fn name(&self) -> &'static str {
        "expression"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        for (var, expression) in &self.assignments {
            let value = context.evaluate(expression)?;
            context.vars.insert(var.clone(), value);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use crate::policies::test_support::*;
    use crate::policy::PolicyError;
    use hyper::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_sets_vars_in_order() {
        let policy = build(
            "expression",
            json!({"set": {"user": "req.headers['x-user']", "greeting": "'hi ' + vars.user"}}),
        )
        .unwrap();
        let mut ctx = request(Method::GET, "/", &[("x-user", "bob")], "");
        policy.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.vars.get("user"), Some(&json!("bob")));
        assert_eq!(ctx.vars.get("greeting"), Some(&json!("hi bob")));
    }

    #[tokio::test]
    async fn test_failure_is_error() {
        let policy = build("expression", json!({"set": {"x": "nope.value"}})).unwrap();
        assert!(matches!(
            policy.handle(&mut get("/")).await.unwrap_err(),
            PolicyError::Evaluation(_)
        ));
    }
}
