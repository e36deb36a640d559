//! Right-hand sides of UPDATE ... SET assignments

use serde_json::Value;

use crate::statement::ParamSink;

/// Value assigned to a column by an UPDATE
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateValue {
    /// Bound as a parameter: `field=:set_field`
    Value(Value),
    /// `field=(field+step)`; a negative step subtracts
    Increment(i64),
    /// `field=(field-step)`; a negative step adds
    Decrement(i64),
    /// Raw SQL: `field=(expression)`
    Expression(String),
}

impl UpdateValue {
    pub fn increment(step: i64) -> Self {
        Self::Increment(step)
    }

    pub fn decrement(step: i64) -> Self {
        Self::Decrement(step)
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression(expression.into())
    }

    pub(crate) fn render(&self, field: &str, sink: &mut ParamSink) -> String {
        match self {
            Self::Value(value) => {
                let placeholder = sink.bind(&format!("set_{}", field), None, value.clone());
                format!("{}={}", field, placeholder)
            }
            Self::Increment(step) => step_assignment(field, *step),
            Self::Decrement(step) => step_assignment(field, step.saturating_neg()),
            Self::Expression(expression) => format!("{}=({})", field, expression),
        }
    }
}

fn step_assignment(field: &str, delta: i64) -> String {
    if delta < 0 {
        format!("{}=({}-{})", field, field, delta.unsigned_abs())
    } else {
        format!("{}=({}+{})", field, field, delta)
    }
}

macro_rules! update_value_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for UpdateValue {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

update_value_from!(Value, &str, String, i32, i64, u32, u64, f64, bool);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::BindMode;

    fn render(field: &str, value: UpdateValue) -> String {
        let mut sink = ParamSink::new(BindMode::Named);
        value.render(field, &mut sink)
    }

    #[test]
    fn steps_render_with_sign() {
        assert_eq!(render("age", UpdateValue::increment(1)), "age=(age+1)");
        assert_eq!(render("age", UpdateValue::increment(-1)), "age=(age-1)");
        assert_eq!(render("age", UpdateValue::decrement(2)), "age=(age-2)");
        assert_eq!(render("age", UpdateValue::decrement(-3)), "age=(age+3)");
    }

    #[test]
    fn expression_is_wrapped() {
        assert_eq!(
            render("total", UpdateValue::expression("price * qty")),
            "total=(price * qty)"
        );
    }

    #[test]
    fn plain_value_is_bound() {
        let mut sink = ParamSink::new(BindMode::Named);
        let sql = UpdateValue::from("shipped").render("status", &mut sink);
        assert_eq!(sql, "status=:set_status");
        assert_eq!(
            sink.finish().get("set_status"),
            Some(&Value::from("shipped"))
        );
    }
}
