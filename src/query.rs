/*!
The composable filter-expression algebra used by every query path,
rendered to archive query documents by [Expr::to_query].

An [Expr] is either empty, a [Comparison](Expr::Comparison) of a dotted
field path against an [Operator], or a logical combination of other
expressions.  [Field] builds comparisons with an optional query context
that is silently and-ed into every predicate it produces.
*/

use serde_json::Value as Json;

/// An operator applied to an operand which is to be matched.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    /// Equal to.
    Eq(Json),
    /// Not equal to.
    Ne(Json),
    /// Greater than.
    Gt(Json),
    /// Greater than or equal.
    Gte(Json),
    /// Less than.
    Lt(Json),
    /// Less than or equal.
    Lte(Json),
    /// One of.
    In(Vec<Json>),
    /// None of.
    Nin(Vec<Json>),
    /// The field exists (or not).
    Exists(bool),
    /// An array element matches the given document.
    ElemMatch(Json),
}

impl Operator {
    fn to_query(&self) -> Json {
        match self {
            Operator::Eq(value) => serde_json::json!({ "$eq": value }),
            Operator::Ne(value) => serde_json::json!({ "$ne": value }),
            Operator::Gt(value) => serde_json::json!({ "$gt": value }),
            Operator::Gte(value) => serde_json::json!({ "$gte": value }),
            Operator::Lt(value) => serde_json::json!({ "$lt": value }),
            Operator::Lte(value) => serde_json::json!({ "$lte": value }),
            Operator::In(values) => serde_json::json!({ "$in": values }),
            Operator::Nin(values) => serde_json::json!({ "$nin": values }),
            Operator::Exists(exists) => serde_json::json!({ "$exists": exists }),
            Operator::ElemMatch(doc) => serde_json::json!({ "$elemMatch": doc }),
        }
    }
}

/// A query expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Matches everything.
    Empty,
    /// A field matched against an operator, e.g. `colour == "red"`.
    Comparison {
        /// The dotted path of the field.
        field: String,
        /// The operator to apply.
        op: Operator,
    },
    /// Every sub-expression must match.
    And(Vec<Expr>),
    /// At least one sub-expression must match.
    Or(Vec<Expr>),
    /// No sub-expression may match.
    Nor(Vec<Expr>),
    /// The sub-expression must not match.
    Not(Box<Expr>),
}

impl Expr {
    /// Conjunction, fusing with same-kind peers to avoid gratuitous
    /// nesting.
    pub fn and(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::Empty, other) => other,
            (one, Expr::Empty) => one,
            (Expr::And(mut left), Expr::And(right)) => {
                left.extend(right);
                Expr::And(left)
            }
            (Expr::And(mut left), right) => {
                left.push(right);
                Expr::And(left)
            }
            (left, Expr::And(mut right)) => {
                right.insert(0, left);
                Expr::And(right)
            }
            (left, right) => Expr::And(vec![left, right]),
        }
    }

    /// Disjunction, fusing with same-kind peers.
    pub fn or(self, other: Expr) -> Expr {
        match (self, other) {
            (Expr::Or(mut left), Expr::Or(right)) => {
                left.extend(right);
                Expr::Or(left)
            }
            (Expr::Or(mut left), right) => {
                left.push(right);
                Expr::Or(left)
            }
            (left, Expr::Or(mut right)) => {
                right.insert(0, left);
                Expr::Or(right)
            }
            (left, right) => Expr::Or(vec![left, right]),
        }
    }

    /// Negation.
    pub fn negate(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Build an expression from a plain query document; several keys are
    /// an implicit conjunction.
    pub fn from_document(document: &serde_json::Map<String, Json>) -> Expr {
        let mut parts = Vec::new();
        for (field, value) in document {
            parts.push(Expr::Comparison {
                field: field.clone(),
                op: Operator::Eq(value.clone()),
            });
        }
        match parts.len() {
            0 => Expr::Empty,
            1 => parts.into_iter().next().unwrap(),
            _ => Expr::And(parts),
        }
    }

    /// Render to the archive query document.
    pub fn to_query(&self) -> Json {
        match self {
            Expr::Empty => serde_json::json!({}),
            Expr::Comparison { field, op } => match op {
                // Equality renders without the explicit operator key.
                Operator::Eq(value) => serde_json::json!({ field.as_str(): value }),
                other => serde_json::json!({ field.as_str(): other.to_query() }),
            },
            Expr::And(parts) => Self::list_query("$and", parts),
            Expr::Or(parts) => Self::list_query("$or", parts),
            Expr::Nor(parts) => Self::list_query("$nor", parts),
            Expr::Not(inner) => serde_json::json!({ "$not": inner.to_query() }),
        }
    }

    /// List operators with a single child unwrap to that child.
    fn list_query(oper: &str, parts: &[Expr]) -> Json {
        if parts.len() == 1 {
            return parts[0].to_query();
        }
        let rendered: Vec<Json> = parts.iter().map(Expr::to_query).collect();
        serde_json::json!({ oper: rendered })
    }

    /// True if this expression matches everything.
    pub fn is_empty(&self) -> bool {
        matches!(self, Expr::Empty)
    }
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Empty
    }
}

impl std::ops::BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl std::ops::BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

/// A queryable field carrying a dotted path and an optional query context
/// expression that scopes every predicate produced from it.
#[derive(Debug, Clone)]
pub struct Field {
    path: String,
    context: Option<Box<Expr>>,
}

impl Field {
    /// A field at the given dotted path.
    pub fn new(path: impl Into<String>) -> Field {
        Field {
            path: path.into(),
            context: None,
        }
    }

    /// Access a subfield, composing the dotted path.
    pub fn subfield(&self, name: &str) -> Field {
        Field {
            path: format!("{}.{}", self.path, name),
            context: self.context.clone(),
        }
    }

    /// Attach a query context to this field.
    pub fn with_context(mut self, context: Expr) -> Field {
        self.context = Some(Box::new(context));
        self
    }

    /// The dotted path of the field.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn compare(&self, op: Operator) -> Expr {
        let comparison = Expr::Comparison {
            field: self.path.clone(),
            op,
        };
        match &self.context {
            Some(context) => (**context).clone().and(comparison),
            None => comparison,
        }
    }

    /// `field == value`
    pub fn eq(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Eq(value.into()))
    }

    /// `field != value`
    pub fn ne(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Ne(value.into()))
    }

    /// `field > value`
    pub fn gt(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Gt(value.into()))
    }

    /// `field >= value`
    pub fn gte(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Gte(value.into()))
    }

    /// `field < value`
    pub fn lt(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Lt(value.into()))
    }

    /// `field <= value`
    pub fn lte(&self, value: impl Into<Json>) -> Expr {
        self.compare(Operator::Lte(value.into()))
    }

    /// `field` is one of the possibilities.
    pub fn in_(&self, values: impl IntoIterator<Item = impl Into<Json>>) -> Expr {
        self.compare(Operator::In(values.into_iter().map(Into::into).collect()))
    }

    /// `field` is none of the possibilities.
    pub fn nin(&self, values: impl IntoIterator<Item = impl Into<Json>>) -> Expr {
        self.compare(Operator::Nin(values.into_iter().map(Into::into).collect()))
    }

    /// The field exists (or not).
    pub fn exists(&self, exists: bool) -> Expr {
        self.compare(Operator::Exists(exists))
    }

    /// An element of the array field matches the given document.
    pub fn elem_match(&self, document: Json) -> Expr {
        self.compare(Operator::ElemMatch(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_renders_without_operator() {
        let expr = Field::new("colour").eq("red");
        assert_eq!(expr.to_query(), serde_json::json!({"colour": "red"}));
    }

    #[test]
    fn test_comparison_operator_render() {
        let expr = Field::new("age").gt(34);
        assert_eq!(expr.to_query(), serde_json::json!({"age": {"$gt": 34}}));
    }

    #[test]
    fn test_and_fuses() {
        let expr = Field::new("a").eq(1) & Field::new("b").eq(2) & Field::new("c").eq(3);
        match &expr {
            Expr::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected a fused and, got {:?}", other),
        }
        assert_eq!(
            expr.to_query(),
            serde_json::json!({"$and": [{"a": 1}, {"b": 2}, {"c": 3}]})
        );
    }

    #[test]
    fn test_single_child_unwraps() {
        let expr = Expr::And(vec![Field::new("a").eq(1)]);
        assert_eq!(expr.to_query(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_document_is_implicit_conjunction() {
        let document = serde_json::json!({"colour": "red", "make": "fiat"});
        let expr = Expr::from_document(document.as_object().unwrap());
        assert_eq!(
            expr.to_query(),
            serde_json::json!({"$and": [{"colour": "red"}, {"make": "fiat"}]})
        );
    }

    #[test]
    fn test_subfield_composes_dotted_path() {
        let state = Field::new("state");
        let expr = state.subfield("colour").eq("white");
        assert_eq!(expr.to_query(), serde_json::json!({"state.colour": "white"}));
    }

    #[test]
    fn test_query_context_is_anded_in() {
        let field = Field::new("age").with_context(Field::new("city").eq("Edinburgh"));
        let expr = field.gt(34);
        assert_eq!(
            expr.to_query(),
            serde_json::json!({"$and": [{"city": "Edinburgh"}, {"age": {"$gt": 34}}]})
        );
    }

    #[test]
    fn test_in_and_empty() {
        let expr = Field::new("obj_id").in_(vec!["a", "b"]);
        assert_eq!(
            expr.to_query(),
            serde_json::json!({"obj_id": {"$in": ["a", "b"]}})
        );
        assert_eq!(Expr::Empty.to_query(), serde_json::json!({}));
        assert!((Expr::Empty & Field::new("a").eq(1)).to_query()["a"].is_number());
    }
}
