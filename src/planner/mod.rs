//! Compiles executable documents into traversal plans. A plan mirrors the
//! document's selection sets: fields keyed by response key, fragment spreads
//! and inline fragments folded into type-conditioned cases, arguments kept as
//! AST templates that resolve against variables on demand.
//!
//! Plans are cached by document identity (pointer identity of the `Arc`,
//! held weakly), so planning a document twice is a map lookup.

use crate::config::CacheConfig;
use crate::config::ConnectionSpec;
use crate::config::OperationKind;
use crate::error::CacheError;
use crate::graph::FieldMap;
use apollo_compiler::ast::DirectiveList;
use apollo_compiler::ast::OperationType;
use apollo_compiler::ast::Value as AstValue;
use apollo_compiler::executable::Operation;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::SelectionSet;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::Weak;

pub(crate) mod arguments;

pub(crate) use arguments::canonical_json;
pub(crate) use arguments::OperationConditional;
pub(crate) use arguments::OperationConditionalKind;
pub(crate) use arguments::BooleanOrVariable;

/// Documents are shared, preparsed ASTs.
pub type Document = Arc<ExecutableDocument>;

#[derive(Debug)]
pub struct Plan {
    pub(crate) kind: OperationKind,
    /// The type name the root selection set is spread on (`Query`,
    /// `Mutation`, a subscription root, or a fragment's type condition).
    pub(crate) root_type: String,
    pub(crate) root: PlanSelectionSet,
    pub(crate) node_count: u32,
}

impl Plan {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }
}

#[derive(Debug, Default)]
pub(crate) struct PlanSelectionSet {
    pub(crate) fields: Vec<Rc<PlanField>>,
    pub(crate) type_cases: Vec<PlanTypeCase>,
}

#[derive(Debug)]
pub(crate) struct PlanTypeCase {
    /// `None` for a condition-less inline fragment, which matches anything.
    pub(crate) type_condition: Option<String>,
    pub(crate) conditionals: Vec<OperationConditional>,
    pub(crate) selections: PlanSelectionSet,
}

#[derive(Debug)]
pub struct PlanField {
    pub(crate) id: u32,
    pub(crate) field_name: String,
    pub(crate) alias: Option<String>,
    pub(crate) response_key: String,
    pub(crate) arguments: Vec<(String, Node<AstValue>)>,
    pub(crate) conditionals: Vec<OperationConditional>,
    pub(crate) connection: Option<ConnectionSpec>,
    pub(crate) selections: PlanSelectionSet,
}

impl PlanField {
    pub(crate) fn args(&self, variables: &FieldMap) -> Result<FieldMap, CacheError> {
        arguments::canonical_args(&self.arguments, variables)
    }

    pub(crate) fn storage_key(&self, args: &FieldMap) -> String {
        arguments::storage_key(&self.field_name, args)
    }

    pub(crate) fn included(&self, variables: &FieldMap) -> bool {
        self.conditionals
            .iter()
            .all(|conditional| conditional.passes(variables))
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.selections.is_empty()
    }
}

impl PlanSelectionSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.type_cases.is_empty()
    }

    /// The CollectFields discipline: own fields first, then every matching
    /// type case in declaration order. Conditionals are evaluated against the
    /// variables; non-matching cases are skipped wholesale.
    pub(crate) fn collect_fields<'a>(
        &'a self,
        config: &CacheConfig,
        typename: &str,
        variables: &FieldMap,
        out: &mut Vec<&'a Rc<PlanField>>,
    ) {
        for field in &self.fields {
            if field.included(variables) {
                out.push(field);
            }
        }
        for case in &self.type_cases {
            let matches = match &case.type_condition {
                None => true,
                Some(condition) => config.type_matches(typename, condition),
            };
            if !matches {
                continue;
            }
            if !case
                .conditionals
                .iter()
                .all(|conditional| conditional.passes(variables))
            {
                continue;
            }
            case.selections
                .collect_fields(config, typename, variables, out);
        }
    }

    /// Finds a selection by response key, looking through type cases. Used
    /// for structural lookups (`edges`, `node`, `pageInfo`) where the runtime
    /// type does not matter.
    pub(crate) fn field(&self, response_key: &str) -> Option<&Rc<PlanField>> {
        if let Some(field) = self
            .fields
            .iter()
            .find(|field| field.response_key == response_key)
        {
            return Some(field);
        }
        self.type_cases
            .iter()
            .find_map(|case| case.selections.field(response_key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanCacheKey {
    document: usize,
    operation: Option<String>,
    fragment: bool,
}

struct CachedPlan {
    document: Weak<ExecutableDocument>,
    plan: Rc<Plan>,
}

/// Compiles and caches plans. One per cache instance.
#[derive(Default)]
pub struct Planner {
    plans: RefCell<HashMap<PlanCacheKey, CachedPlan>>,
}

impl Planner {
    pub(crate) fn plan_operation(
        &self,
        config: &CacheConfig,
        document: &Document,
        operation_name: Option<&str>,
    ) -> Result<Rc<Plan>, CacheError> {
        let key = PlanCacheKey {
            document: Arc::as_ptr(document) as usize,
            operation: operation_name.map(str::to_string),
            fragment: false,
        };
        if let Some(plan) = self.lookup(&key, document) {
            return Ok(plan);
        }
        let operation = find_operation(document, operation_name)?;
        let mut builder = PlanBuilder {
            config,
            document,
            next_id: 0,
            fragment_stack: Vec::new(),
        };
        let root = builder.build_set(&operation.selection_set)?;
        let plan = Rc::new(Plan {
            kind: operation_kind(operation.operation_type),
            root_type: operation.selection_set.ty.as_str().to_string(),
            root,
            node_count: builder.next_id,
        });
        self.store(key, document, plan.clone());
        Ok(plan)
    }

    pub(crate) fn plan_fragment(
        &self,
        config: &CacheConfig,
        document: &Document,
        fragment_name: Option<&str>,
    ) -> Result<Rc<Plan>, CacheError> {
        let key = PlanCacheKey {
            document: Arc::as_ptr(document) as usize,
            operation: fragment_name.map(str::to_string),
            fragment: true,
        };
        if let Some(plan) = self.lookup(&key, document) {
            return Ok(plan);
        }
        let fragment = match fragment_name {
            Some(name) => document
                .fragments
                .iter()
                .find(|(fragment, _)| fragment.as_str() == name)
                .map(|(_, fragment)| fragment),
            None => document.fragments.first().map(|(_, fragment)| fragment),
        }
        .ok_or_else(|| {
            CacheError::plan_invalid(match fragment_name {
                Some(name) => format!("unknown fragment \"{name}\""),
                None => "document contains no fragment definitions".to_string(),
            })
        })?;
        let mut builder = PlanBuilder {
            config,
            document,
            next_id: 0,
            fragment_stack: Vec::new(),
        };
        let root = builder.build_set(&fragment.selection_set)?;
        let plan = Rc::new(Plan {
            kind: OperationKind::Query,
            root_type: fragment.selection_set.ty.as_str().to_string(),
            root,
            node_count: builder.next_id,
        });
        self.store(key, document, plan.clone());
        Ok(plan)
    }

    fn lookup(&self, key: &PlanCacheKey, document: &Document) -> Option<Rc<Plan>> {
        let plans = self.plans.borrow();
        let cached = plans.get(key)?;
        let alive = cached
            .document
            .upgrade()
            .is_some_and(|doc| Arc::ptr_eq(&doc, document));
        alive.then(|| cached.plan.clone())
    }

    fn store(&self, key: PlanCacheKey, document: &Document, plan: Rc<Plan>) {
        let mut plans = self.plans.borrow_mut();
        plans.retain(|_, cached| cached.document.strong_count() > 0);
        plans.insert(
            key,
            CachedPlan {
                document: Arc::downgrade(document),
                plan,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn cached_plan_count(&self) -> usize {
        self.plans.borrow().len()
    }
}

fn operation_kind(operation_type: OperationType) -> OperationKind {
    match operation_type {
        OperationType::Query => OperationKind::Query,
        OperationType::Mutation => OperationKind::Mutation,
        OperationType::Subscription => OperationKind::Subscription,
    }
}

fn find_operation<'a>(
    document: &'a ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<&'a Node<Operation>, CacheError> {
    match operation_name {
        Some(name) => document
            .named_operations
            .iter()
            .find(|(operation, _)| operation.as_str() == name)
            .map(|(_, operation)| operation)
            .ok_or_else(|| CacheError::plan_invalid(format!("unknown operation \"{name}\""))),
        None => {
            if let Some(operation) = &document.anonymous_operation {
                return Ok(operation);
            }
            let mut named = document.named_operations.values();
            match (named.next(), named.next()) {
                (Some(operation), None) => Ok(operation),
                (Some(_), Some(_)) => Err(CacheError::plan_invalid(
                    "document defines multiple operations, an operation name is required",
                )),
                (None, _) => Err(CacheError::plan_invalid(
                    "document defines no operations",
                )),
            }
        }
    }
}

struct PlanBuilder<'a> {
    config: &'a CacheConfig,
    document: &'a ExecutableDocument,
    next_id: u32,
    fragment_stack: Vec<String>,
}

impl PlanBuilder<'_> {
    fn build_set(&mut self, set: &SelectionSet) -> Result<PlanSelectionSet, CacheError> {
        let parent_type = set.ty.as_str().to_string();
        let mut fields: Vec<PlanField> = Vec::new();
        let mut by_key: IndexMap<String, usize> = IndexMap::new();
        let mut type_cases: Vec<PlanTypeCase> = Vec::new();

        for selection in &set.selections {
            match selection {
                Selection::Field(field) => {
                    let response_key = field
                        .alias
                        .as_ref()
                        .unwrap_or(&field.name)
                        .as_str()
                        .to_string();
                    let selections = if field.selection_set.selections.is_empty() {
                        PlanSelectionSet::default()
                    } else {
                        self.build_set(&field.selection_set)?
                    };
                    match by_key.get(&response_key) {
                        Some(&index) if fields[index].field_name == field.name.as_str() => {
                            // Same response key selected twice in one set:
                            // merge the child selections.
                            fields[index].selections.fields.extend(selections.fields);
                            fields[index]
                                .selections
                                .type_cases
                                .extend(selections.type_cases);
                        }
                        _ => {
                            let id = self.next_id;
                            self.next_id += 1;
                            by_key.insert(response_key.clone(), fields.len());
                            fields.push(PlanField {
                                id,
                                field_name: field.name.as_str().to_string(),
                                alias: field.alias.as_ref().map(|alias| alias.as_str().to_string()),
                                response_key,
                                arguments: field
                                    .arguments
                                    .iter()
                                    .map(|argument| {
                                        (
                                            argument.name.as_str().to_string(),
                                            argument.value.clone(),
                                        )
                                    })
                                    .collect(),
                                conditionals: conditionals_of(&field.directives),
                                connection: self
                                    .config
                                    .connection(&parent_type, field.name.as_str())
                                    .cloned(),
                                selections,
                            });
                        }
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.fragment_name.as_str().to_string();
                    let fragment =
                        self.document.fragments.get(&spread.fragment_name).ok_or_else(|| {
                            CacheError::plan_invalid(format!("unknown fragment \"{name}\""))
                        })?;
                    if self.fragment_stack.contains(&name) {
                        return Err(CacheError::plan_invalid(format!(
                            "fragment cycle through \"{name}\""
                        )));
                    }
                    self.fragment_stack.push(name);
                    let selections = self.build_set(&fragment.selection_set)?;
                    self.fragment_stack.pop();
                    type_cases.push(PlanTypeCase {
                        type_condition: Some(fragment.selection_set.ty.as_str().to_string()),
                        conditionals: conditionals_of(&spread.directives),
                        selections,
                    });
                }
                Selection::InlineFragment(inline) => {
                    let selections = self.build_set(&inline.selection_set)?;
                    type_cases.push(PlanTypeCase {
                        type_condition: inline
                            .type_condition
                            .as_ref()
                            .map(|condition| condition.as_str().to_string()),
                        conditionals: conditionals_of(&inline.directives),
                        selections,
                    });
                }
            }
        }

        Ok(PlanSelectionSet {
            fields: fields.into_iter().map(Rc::new).collect(),
            type_cases,
        })
    }
}

fn conditionals_of(directives: &DirectiveList) -> Vec<OperationConditional> {
    let mut out = Vec::new();
    for directive in directives.iter() {
        let kind = match directive.name.as_str() {
            "include" => OperationConditionalKind::Include,
            "skip" => OperationConditionalKind::Skip,
            _ => continue,
        };
        let Some(argument) = directive
            .arguments
            .iter()
            .find(|argument| argument.name.as_str() == "if")
        else {
            continue;
        };
        let value = match std::ops::Deref::deref(&argument.value) {
            AstValue::Boolean(value) => BooleanOrVariable::Boolean(*value),
            AstValue::Variable(name) => BooleanOrVariable::Variable(name.as_str().to_string()),
            _ => continue,
        };
        out.push(OperationConditional { kind, value });
    }
    out
}
