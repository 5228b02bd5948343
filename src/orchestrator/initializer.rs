//! Turning a requirements document into tasks and an initial META record.
//!
//! The document is markdown. Every `## ` heading is one feature:
//!
//! ```markdown
//! ## User login
//! Category: functional
//! Priority: 1
//! Depends on: Data model
//!
//! Users sign in with email and password.
//!
//! ### Acceptance Criteria
//! - [ ] Valid credentials redirect to the dashboard
//! - [ ] Invalid credentials show an error message
//!
//! ### Test Steps
//! 1. Open /login
//! 2. Submit valid credentials
//! ```
//!
//! Anything before the first `## ` heading is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{OrchestratorError, StateError};
use crate::provider::{StateProvider, retry_conflicts};
use crate::task::{Category, TaskId, TaskPayload, validate_payload};

/// Used when a feature gives no `Priority:` line.
pub const DEFAULT_PRIORITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Description,
    Criteria,
    Steps,
}

/// One `## ` block before dependency resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub payload: TaskPayload,
    /// Titles of features this one depends on
    pub depends_on: Vec<String>,
}

/// Strip list markers: `- `, `* `, `- [ ] `, `- [x] `, `1. `, `1) `.
fn list_item(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        rest
    } else {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        line[digits..]
            .strip_prefix(". ")
            .or_else(|| line[digits..].strip_prefix(") "))?
    };
    let rest = rest.trim_start();
    let rest = ["[ ] ", "[x] ", "[X] "]
        .iter()
        .find_map(|box_| rest.strip_prefix(box_))
        .unwrap_or(rest);
    let item = rest.trim();
    (!item.is_empty()).then_some(item)
}

/// `Key: value` with a case-insensitive key.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
}

/// Parse the document into features. Only structural problems are reported
/// here; field validation happens in [`Initializer::run`].
pub fn parse_requirements(document: &str) -> Result<Vec<Feature>, OrchestratorError> {
    let mut features: Vec<Feature> = Vec::new();
    let mut description: Vec<String> = Vec::new();
    let mut section = Section::Description;
    let mut problems = Vec::new();

    let flush = |features: &mut Vec<Feature>, description: &mut Vec<String>| {
        if let Some(feature) = features.last_mut() {
            feature.payload.description = description.join("\n").trim().to_string();
        }
        description.clear();
    };

    for line in document.lines() {
        let trimmed = line.trim();
        if let Some(title) = trimmed.strip_prefix("## ") {
            flush(&mut features, &mut description);
            features.push(Feature {
                payload: TaskPayload {
                    title: title.trim().to_string(),
                    description: String::new(),
                    acceptance_criteria: Vec::new(),
                    test_steps: Vec::new(),
                    priority: DEFAULT_PRIORITY,
                    category: Category::Functional,
                    labels: Vec::new(),
                    dependencies: Vec::new(),
                },
                depends_on: Vec::new(),
            });
            section = Section::Description;
            continue;
        }
        let Some(feature) = features.last_mut() else {
            continue;
        };

        if let Some(heading) = trimmed.strip_prefix("### ") {
            let heading = heading.to_lowercase();
            section = if heading.contains("acceptance") || heading.contains("criteria") {
                Section::Criteria
            } else if heading.contains("test") {
                Section::Steps
            } else {
                description.push(trimmed.to_string());
                Section::Description
            };
            continue;
        }

        match section {
            Section::Criteria => {
                if let Some(item) = list_item(line) {
                    feature.payload.acceptance_criteria.push(item.to_string());
                }
            }
            Section::Steps => {
                if let Some(item) = list_item(line) {
                    feature.payload.test_steps.push(item.to_string());
                }
            }
            Section::Description => {
                let title = &feature.payload.title;
                if let Some(value) = field(trimmed, "category") {
                    match value.parse::<Category>() {
                        Ok(c) => feature.payload.category = c,
                        Err(e) => problems.push(format!("'{}': {}", title, e)),
                    }
                } else if let Some(value) = field(trimmed, "priority") {
                    match value.parse::<u8>() {
                        Ok(p) => feature.payload.priority = p,
                        Err(_) => problems.push(format!("'{}': priority '{}' is not a number", title, value)),
                    }
                } else if let Some(value) = field(trimmed, "depends on") {
                    feature.depends_on.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    );
                } else if let Some(value) = field(trimmed, "labels") {
                    feature.payload.labels.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                    );
                } else {
                    description.push(line.to_string());
                }
            }
        }
    }
    flush(&mut features, &mut description);

    if features.is_empty() {
        return Err(OrchestratorError::Requirements(
            "no features found; each feature needs a '## ' heading".to_string(),
        ));
    }
    if !problems.is_empty() {
        return Err(OrchestratorError::Requirements(problems.join("; ")));
    }
    Ok(features)
}

/// Indices of `features` in an order where dependencies come first.
fn creation_order(features: &[Feature]) -> Result<Vec<usize>, OrchestratorError> {
    let index: HashMap<String, usize> = features
        .iter()
        .enumerate()
        .map(|(i, f)| (f.payload.title.to_lowercase(), i))
        .collect();

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(features.len());
    let mut unknown = Vec::new();
    for feature in features {
        let mut resolved = Vec::new();
        for name in &feature.depends_on {
            match index.get(&name.to_lowercase()) {
                Some(i) => resolved.push(*i),
                None => unknown.push(format!("'{}' depends on unknown feature '{}'", feature.payload.title, name)),
            }
        }
        deps.push(resolved);
    }
    if !unknown.is_empty() {
        return Err(OrchestratorError::Requirements(unknown.join("; ")));
    }

    let mut order = Vec::with_capacity(features.len());
    let mut placed = vec![false; features.len()];
    while order.len() < features.len() {
        let ready: Vec<usize> = (0..features.len())
            .filter(|i| !placed[*i] && deps[*i].iter().all(|d| placed[*d]))
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = (0..features.len())
                .filter(|i| !placed[*i])
                .map(|i| features[i].payload.title.as_str())
                .collect();
            return Err(OrchestratorError::Requirements(format!(
                "dependency cycle between: {}",
                stuck.join(", ")
            )));
        }
        for i in ready {
            placed[i] = true;
            order.push(i);
        }
    }
    Ok(order)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitReport {
    /// `(feature title, task id)` in document order
    pub tasks: Vec<(String, TaskId)>,
    pub focus: String,
}

pub struct Initializer {
    provider: Arc<dyn StateProvider>,
}

impl Initializer {
    pub fn new(provider: Arc<dyn StateProvider>) -> Self {
        Self { provider }
    }

    /// Validate every feature, then create tasks and META.
    ///
    /// Nothing is created when any feature is invalid, and tasks created before
    /// a provider failure are deleted again.
    pub async fn run(&self, document: &str) -> Result<InitReport, OrchestratorError> {
        let features = parse_requirements(document)?;

        let problems: Vec<String> = features
            .iter()
            .filter_map(|f| match validate_payload(&f.payload) {
                Err(StateError::Validation(issues)) => Some(
                    issues
                        .into_iter()
                        .map(|i| format!("'{}': {}", f.payload.title, i))
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .flatten()
            .collect();
        if !problems.is_empty() {
            return Err(StateError::Validation(problems).into());
        }
        let order = creation_order(&features)?;

        let mut ids: Vec<Option<TaskId>> = vec![None; features.len()];
        let by_title: HashMap<String, usize> = features
            .iter()
            .enumerate()
            .map(|(i, f)| (f.payload.title.to_lowercase(), i))
            .collect();
        let mut created: Vec<TaskId> = Vec::new();
        for i in order {
            let feature = &features[i];
            let mut payload = feature.payload.clone();
            payload.dependencies = feature
                .depends_on
                .iter()
                .filter_map(|name| by_title.get(&name.to_lowercase()))
                .filter_map(|d| ids[*d].clone())
                .collect();
            match self.provider.create_task(payload).await {
                Ok(id) => {
                    tracing::info!(task = %id, title = %feature.payload.title, "task created");
                    created.push(id.clone());
                    ids[i] = Some(id);
                }
                Err(e) => {
                    tracing::error!(title = %feature.payload.title, error = %e, "task creation failed");
                    self.roll_back(&created).await;
                    return Err(e.into());
                }
            }
        }

        let focus = features[0].payload.title.clone();
        if let Err(e) = retry_conflicts("initial meta", || self.provider.init_meta(&focus)).await {
            self.roll_back(&created).await;
            return Err(e.into());
        }

        let tasks = features
            .iter()
            .zip(ids)
            .filter_map(|(f, id)| Some((f.payload.title.clone(), id?)))
            .collect();
        Ok(InitReport { tasks, focus })
    }

    /// Delete `created`, dependents first, so a rerun starts from nothing.
    async fn roll_back(&self, created: &[TaskId]) {
        for id in created.iter().rev() {
            if let Err(e) = self.provider.delete_task(id).await {
                tracing::error!(task = %id, error = %e, "failed to remove task from an aborted initialization");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::meta::RegressionStatus;
    use crate::provider::tracker::TrackerProvider;
    use crate::provider::tracker::fake::FakeTracker;
    use crate::provider::{FileProvider, RetryPolicy};
    use crate::task::{TaskFilter, TaskStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) const REQUIREMENTS: &str = r#"# Shop

Intro text that is not a feature.

## Product catalog page
Category: functional
Priority: 1

Lists every product with price and stock.

### Acceptance Criteria
- [ ] Catalog lists every product with its price
- [ ] Out-of-stock products show a sold out badge

### Test Steps
1. Open /products
2. Compare with the seeded product list

## Shopping cart drawer
Priority: 2
Depends on: Product catalog page

### Acceptance Criteria
- Adding a product increments the cart badge
- Cart total equals the sum of line prices

## Checkout confirmation email
Category: infrastructure
Depends on: Shopping cart drawer

### Acceptance Criteria
1. Order confirmation email is sent within one minute
"#;

    fn provider() -> (TempDir, Arc<dyn StateProvider>) {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn StateProvider> =
            Arc::new(FileProvider::new(&dir.path().join("state")).unwrap());
        (dir, provider)
    }

    #[test]
    fn test_parse_features() {
        let features = parse_requirements(REQUIREMENTS).unwrap();
        assert_eq!(features.len(), 3);
        let catalog = &features[0].payload;
        assert_eq!(catalog.title, "Product catalog page");
        assert_eq!(catalog.priority, 1);
        assert_eq!(catalog.description, "Lists every product with price and stock.");
        assert_eq!(catalog.acceptance_criteria.len(), 2);
        assert_eq!(catalog.test_steps, vec!["Open /products", "Compare with the seeded product list"]);
        assert_eq!(features[1].depends_on, vec!["Product catalog page"]);
        assert_eq!(features[2].payload.category, Category::Infrastructure);
        assert_eq!(features[2].payload.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_list_item_markers() {
        assert_eq!(list_item("- [ ] Do a thing"), Some("Do a thing"));
        assert_eq!(list_item("* [x] Done thing"), Some("Done thing"));
        assert_eq!(list_item("12) Step twelve"), Some("Step twelve"));
        assert_eq!(list_item("Plain prose"), None);
        assert_eq!(list_item("- "), None);
    }

    #[test]
    fn test_no_features_is_an_error() {
        assert!(matches!(
            parse_requirements("# Title\nJust prose."),
            Err(OrchestratorError::Requirements(_))
        ));
    }

    #[test]
    fn test_bad_category_reported() {
        let err = parse_requirements("## Some feature here\nCategory: magic\n").unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_cycle_detected() {
        let doc = "## Feature alpha one\nDepends on: Feature beta two\n### Acceptance Criteria\n- Alpha renders its widget\n\
                   ## Feature beta two\nDepends on: Feature alpha one\n### Acceptance Criteria\n- Beta renders its widget\n";
        let features = parse_requirements(doc).unwrap();
        let err = creation_order(&features).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_three_features_five_criteria() {
        let (_dir, provider) = provider();
        let report = Initializer::new(provider.clone()).run(REQUIREMENTS).await.unwrap();
        assert_eq!(report.tasks.len(), 3);
        assert_eq!(report.focus, "Product catalog page");

        let tasks = provider.get_tasks(&TaskFilter::all()).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| !t.acceptance_criteria.is_empty()));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Todo));
        let criteria: usize = tasks.iter().map(|t| t.acceptance_criteria.len()).sum();
        assert_eq!(criteria, 5);

        let cart = tasks.iter().find(|t| t.title == "Shopping cart drawer").unwrap();
        let catalog = tasks.iter().find(|t| t.title == "Product catalog page").unwrap();
        assert_eq!(cart.dependencies, vec![catalog.id.clone()]);

        let meta = provider.get_meta().await.unwrap().unwrap();
        assert_eq!(meta.regression_status, RegressionStatus::Unknown);
        assert!(meta.architecture_decisions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_feature_creates_nothing() {
        let (_dir, provider) = provider();
        let doc = format!("{}\n## Broken feature title\n### Acceptance Criteria\n- It works\n", REQUIREMENTS);
        let err = Initializer::new(provider.clone()).run(&doc).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::State(StateError::Validation(_))));
        assert!(err.to_string().contains("Broken feature title"));
        assert!(provider.get_tasks(&TaskFilter::all()).await.unwrap().is_empty());
        assert!(provider.get_meta().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_create_removes_earlier_tasks() {
        let tracker = Arc::new(FakeTracker::default());
        *tracker.create_budget.lock().unwrap() = Some(2);
        let provider: Arc<dyn StateProvider> = Arc::new(TrackerProvider::new(
            tracker.clone(),
            Duration::ZERO,
            RetryPolicy::immediate(0),
        ));

        let err = Initializer::new(provider.clone()).run(REQUIREMENTS).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::ProviderUnavailable { .. })
        ));
        assert!(provider.get_tasks(&TaskFilter::all()).await.unwrap().is_empty());
        assert!(provider.get_meta().await.unwrap().is_none());

        // A rerun against a healthy provider yields exactly one task per feature.
        *tracker.create_budget.lock().unwrap() = None;
        Initializer::new(provider.clone()).run(REQUIREMENTS).await.unwrap();
        assert_eq!(provider.get_tasks(&TaskFilter::all()).await.unwrap().len(), 3);
    }
}
