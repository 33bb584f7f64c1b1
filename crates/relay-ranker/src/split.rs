//! Heuristic task splitting: a splitter cascade shared by sequential
//! decomposition and swarm DAG construction, plus the graph machinery for
//! swarm (edge layers, transitive reduction, cycle guard, wave peeling).

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use relay_types::{BudgetTier, Category, Pricing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMethod {
    Numbered,
    Bulleted,
    Conjunctions,
    Semicolons,
    Paragraphs,
    Coordination,
}

impl SplitMethod {
    /// Only splits that imply an ordering chain consecutive sub-tasks.
    /// Coordination ("and") is parallel by nature and does not.
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::Numbered | Self::Conjunctions)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct CostEstimate {
    pub min_usd: f64,
    pub max_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub index: usize,
    pub text: String,
    pub category: Category,
    pub budget: BudgetTier,
    pub phase: u8,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    pub wave: u32,
    #[serde(default)]
    pub cost_estimate: CostEstimate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    pub decomposed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<SplitMethod>,
    #[serde(default)]
    pub subtasks: Vec<SubTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Decomposition {
    pub fn empty() -> Self {
        Self {
            decomposed: false,
            method: None,
            subtasks: Vec::new(),
            warning: None,
        }
    }
}

fn numbered_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+[.)]\s+").expect("valid regex"))
}

fn bulleted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*•]\s+").expect("valid regex"))
}

fn conjunction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[,.]?\s*\b(?:and then|then|next|finally|after that|afterwards|lastly)\b[,:]?\s+")
            .expect("valid regex")
    })
}

fn coordination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s+\band\b\s+").expect("valid regex"))
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("valid regex"))
}

/// Apply the splitter cascade; the first pattern yielding at least two
/// non-empty parts wins.
pub fn split_task(task: &str) -> Option<(SplitMethod, Vec<String>)> {
    if let Some(parts) = split_marked_lines(task, numbered_re()) {
        return Some((SplitMethod::Numbered, parts));
    }
    if let Some(parts) = split_marked_lines(task, bulleted_re()) {
        return Some((SplitMethod::Bulleted, parts));
    }
    if let Some(parts) = split_by_regex(task, conjunction_re()) {
        return Some((SplitMethod::Conjunctions, parts));
    }
    if let Some(parts) = split_on(task, ';') {
        return Some((SplitMethod::Semicolons, parts));
    }
    if let Some(parts) = split_by_regex(task, paragraph_re()) {
        return Some((SplitMethod::Paragraphs, parts));
    }
    if let Some(parts) = split_by_regex(task, coordination_re()) {
        return Some((SplitMethod::Coordination, parts));
    }
    None
}

fn split_marked_lines(task: &str, marker: &Regex) -> Option<Vec<String>> {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    for line in task.lines() {
        if marker.is_match(line) {
            if let Some(done) = current.take() {
                parts.push(done);
            }
            current = Some(marker.replace(line, "").trim().to_string());
        } else if let Some(open) = current.as_mut() {
            open.push(' ');
            open.push_str(line.trim());
        }
    }
    if let Some(done) = current.take() {
        parts.push(done);
    }
    finish_parts(parts)
}

fn split_by_regex(task: &str, re: &Regex) -> Option<Vec<String>> {
    let parts = re
        .split(task)
        .map(|p| p.trim().to_string())
        .collect::<Vec<_>>();
    finish_parts(parts)
}

fn split_on(task: &str, separator: char) -> Option<Vec<String>> {
    let parts = task
        .split(separator)
        .map(|p| p.trim().to_string())
        .collect::<Vec<_>>();
    finish_parts(parts)
}

fn finish_parts(parts: Vec<String>) -> Option<Vec<String>> {
    let parts = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>();
    if parts.len() >= 2 {
        Some(parts)
    } else {
        None
    }
}

const DOWNGRADE_KEYWORDS: [&str; 7] = [
    "simple",
    "quick",
    "boilerplate",
    "trivial",
    "basic",
    "straightforward",
    "easy",
];

const UPGRADE_KEYWORDS: [&str; 7] = [
    "critical",
    "complex",
    "architecture",
    "security",
    "performance",
    "optimize",
    "core",
];

/// One step cheaper on downgrade keywords, one step dearer on upgrade
/// keywords; both present cancel out.
pub fn adjust_budget(text: &str, base: BudgetTier) -> BudgetTier {
    let lower = text.to_lowercase();
    let down = DOWNGRADE_KEYWORDS.iter().any(|k| lower.contains(k));
    let up = UPGRADE_KEYWORDS.iter().any(|k| lower.contains(k));
    match (down, up) {
        (true, false) => base.cheaper(),
        (false, true) => base.dearer(),
        _ => base,
    }
}

fn category_keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::Coding => &[
            "code", "implement", "function", "class", "api", "refactor", "debug", "bug",
            "compile", "script", "endpoint", "backend", "frontend", "test", "database",
            "deploy", "build",
        ],
        Category::Reasoning => &[
            "analyze", "reason", "evaluate", "compare", "assess", "decide", "logic", "math",
            "prove", "tradeoff", "why",
        ],
        Category::Creative => &[
            "write", "story", "creative", "poem", "haiku", "blog", "essay", "copy", "slogan",
            "name", "brainstorm",
        ],
        Category::Research => &[
            "research", "investigate", "survey", "summarize", "sources", "literature",
            "explore", "find out", "gather",
        ],
        Category::Vision => &["image", "screenshot", "diagram", "photo", "visual", "chart"],
        Category::General | Category::FastCheap => &[],
    }
}

/// Keyword-majority classification; ties go to the first category in
/// declaration order, no keywords at all means general.
pub fn classify(text: &str) -> Category {
    let lower = text.to_lowercase();
    let mut best = Category::General;
    let mut best_hits = 0usize;
    for category in [
        Category::Coding,
        Category::Reasoning,
        Category::Creative,
        Category::Research,
        Category::Vision,
    ] {
        let hits = category_keywords(category)
            .iter()
            .filter(|k| lower.contains(*k))
            .count();
        if hits > best_hits {
            best = category;
            best_hits = hits;
        }
    }
    best
}

const PHASE_KEYWORDS: [&[&str]; 6] = [
    &["design", "plan", "architect", "spec", "outline", "sketch"],
    &["setup", "scaffold", "install", "configure", "init", "bootstrap"],
    &["implement", "build", "create", "write", "code", "develop", "add"],
    &["integrate", "connect", "wire", "combine", "hook up", "compose"],
    &["test", "verify", "validate", "qa", "check", "cover"],
    &["deploy", "release", "document", "docs", "publish", "ship"],
];

/// Phase 0-5 by keyword majority; nothing recognized lands in the implement
/// phase so unlabeled work still slots between setup and testing.
pub fn detect_phase(text: &str) -> u8 {
    let lower = text.to_lowercase();
    let mut best = 2u8;
    let mut best_hits = 0usize;
    for (phase, keywords) in PHASE_KEYWORDS.iter().enumerate() {
        let hits = keywords.iter().filter(|k| lower.contains(*k)).count();
        if hits > best_hits {
            best = phase as u8;
            best_hits = hits;
        }
    }
    best
}

fn artifact_res() -> &'static [(&'static str, Regex)] {
    static RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            ("schema", r"(?i)\b(schema|database|table|migration|model)\b"),
            ("api", r"(?i)\b(api|endpoint|route|rest|graphql|backend)\b"),
            (
                "component",
                r"(?i)\b(component|ui|frontend|page|view|widget)\b",
            ),
            ("config", r"(?i)\b(config|settings|env|yaml|toml)\b"),
            ("test", r"(?i)\b(test|tests|spec|coverage)\b"),
            ("docs", r"(?i)\b(doc|docs|readme|guide)\b"),
        ]
        .into_iter()
        .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
        .collect()
    })
    .as_slice()
}

pub fn detect_artifacts(text: &str) -> Vec<String> {
    artifact_res()
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Rough per-task spend assuming 1K tokens on the low bound and 10K on the
/// high bound.
pub fn estimate_cost(pricing: Option<Pricing>) -> CostEstimate {
    let pricing = pricing.unwrap_or(Pricing {
        prompt: 1.0,
        completion: 3.0,
    });
    let per_token = (pricing.prompt + pricing.completion) / 1e6;
    CostEstimate {
        min_usd: 1_000.0 * per_token,
        max_usd: 10_000.0 * per_token,
    }
}

/// Sequential decomposition: classify and budget-adjust each part; callers
/// chain the steps.
pub fn sequential_subtasks(parts: &[String], base_budget: BudgetTier) -> Vec<SubTask> {
    parts
        .iter()
        .enumerate()
        .map(|(index, text)| SubTask {
            index,
            text: text.clone(),
            category: classify(text),
            budget: adjust_budget(text, base_budget),
            phase: detect_phase(text),
            artifacts: detect_artifacts(text),
            depends_on: if index == 0 { Vec::new() } else { vec![index - 1] },
            wave: index as u32,
            cost_estimate: estimate_cost(None),
            model: None,
            model_pricing: None,
        })
        .collect()
}

/// Swarm DAG construction over the split parts. Returns the sub-tasks with
/// `depends_on` and `wave` filled in, plus a warning when the heuristic edges
/// formed a cycle and were replaced by a linear chain.
pub fn swarm_subtasks(
    parts: &[String],
    method: SplitMethod,
    base_budget: BudgetTier,
    max_parallel: usize,
) -> (Vec<SubTask>, Option<String>) {
    let mut tasks = parts
        .iter()
        .enumerate()
        .map(|(index, text)| SubTask {
            index,
            text: text.clone(),
            category: classify(text),
            budget: adjust_budget(text, base_budget),
            phase: detect_phase(text),
            artifacts: detect_artifacts(text),
            depends_on: Vec::new(),
            wave: 0,
            cost_estimate: estimate_cost(None),
            model: None,
            model_pricing: None,
        })
        .collect::<Vec<_>>();

    let mut edges = BTreeSet::new();

    // Layer 1: adjacent phases form a full bipartite dependency.
    let mut phases = tasks.iter().map(|t| t.phase).collect::<Vec<_>>();
    phases.sort_unstable();
    phases.dedup();
    for pair in phases.windows(2) {
        for a in tasks.iter().filter(|t| t.phase == pair[0]) {
            for b in tasks.iter().filter(|t| t.phase == pair[1]) {
                edges.insert((a.index, b.index));
            }
        }
    }

    // Layer 2: shared artifact categories order producers before consumers.
    // Equal phases tie-break on discovery order so the pair cannot form a
    // two-cycle on its own.
    for a in &tasks {
        for b in &tasks {
            let ordered = a.phase < b.phase || (a.phase == b.phase && a.index < b.index);
            if ordered && a.artifacts.iter().any(|art| b.artifacts.contains(art)) {
                edges.insert((a.index, b.index));
            }
        }
    }

    // Layer 3: explicitly ordered splits chain consecutive sub-tasks.
    if method.is_sequential() {
        for index in 1..tasks.len() {
            edges.insert((index - 1, index));
        }
    }

    let mut edges = edges.into_iter().collect::<Vec<_>>();
    let mut warning = None;
    if !is_acyclic(tasks.len(), &edges) {
        edges = (1..tasks.len()).map(|i| (i - 1, i)).collect();
        warning = Some(
            "dependency heuristics formed a cycle; fell back to a linear chain".to_string(),
        );
    } else {
        edges = transitive_reduction(tasks.len(), edges);
    }

    for (from, to) in &edges {
        tasks[*to].depends_on.push(*from);
    }
    for task in &mut tasks {
        task.depends_on.sort_unstable();
    }

    let waves = assign_waves(tasks.len(), &edges, max_parallel);
    for (task, wave) in tasks.iter_mut().zip(waves) {
        task.wave = wave;
    }

    (tasks, warning)
}

/// Kahn's algorithm; true when every node can be peeled.
pub fn is_acyclic(n: usize, edges: &[(usize, usize)]) -> bool {
    let mut indegree = vec![0usize; n];
    let mut adjacency = vec![Vec::new(); n];
    for (from, to) in edges {
        indegree[*to] += 1;
        adjacency[*from].push(*to);
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
    let mut seen = 0usize;
    while let Some(node) = queue.pop_front() {
        seen += 1;
        for &next in &adjacency[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    seen == n
}

/// Drop `a -> c` whenever another direct successor of `a` already reaches `c`.
pub fn transitive_reduction(n: usize, edges: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    let mut adjacency = vec![Vec::new(); n];
    for (from, to) in &edges {
        adjacency[*from].push(*to);
    }

    let reaches = |start: usize, target: usize| -> bool {
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if visited.insert(node) {
                stack.extend(adjacency[node].iter().copied());
            }
        }
        false
    };

    edges
        .iter()
        .copied()
        .filter(|(from, to)| {
            !adjacency[*from]
                .iter()
                .any(|&mid| mid != *to && reaches(mid, *to))
        })
        .collect()
}

/// Repeated peeling: sources get wave 0; each ready batch is chunked to at
/// most `max_parallel` nodes per wave increment.
pub fn assign_waves(n: usize, edges: &[(usize, usize)], max_parallel: usize) -> Vec<u32> {
    let max_parallel = max_parallel.max(1);
    let mut preds = vec![Vec::new(); n];
    for (from, to) in edges {
        preds[*to].push(*from);
    }

    let mut waves = vec![u32::MAX; n];
    let mut assigned = vec![false; n];
    let mut next_wave = 0u32;
    let mut remaining = n;
    while remaining > 0 {
        let ready = (0..n)
            .filter(|&i| !assigned[i] && preds[i].iter().all(|&p| assigned[p]))
            .collect::<Vec<_>>();
        if ready.is_empty() {
            // Unreachable for acyclic input; bail out rather than spin.
            for i in 0..n {
                if !assigned[i] {
                    waves[i] = next_wave;
                }
            }
            break;
        }
        for chunk in ready.chunks(max_parallel) {
            for &i in chunk {
                waves[i] = next_wave;
                assigned[i] = true;
                remaining -= 1;
            }
            next_wave += 1;
        }
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_lists_win_the_cascade() {
        let (method, parts) =
            split_task("1. design the schema\n2) build the api\n3. write tests").expect("split");
        assert_eq!(method, SplitMethod::Numbered);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "design the schema");
    }

    #[test]
    fn bulleted_lists_split() {
        let (method, parts) =
            split_task("- research competitors\n- summarize findings").expect("split");
        assert_eq!(method, SplitMethod::Bulleted);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn continuation_lines_join_their_item() {
        let (_, parts) =
            split_task("1. design the schema\n   with audit tables\n2. build the api")
                .expect("split");
        assert_eq!(parts[0], "design the schema with audit tables");
    }

    #[test]
    fn conjunctions_split_sequentially() {
        let (method, parts) =
            split_task("draft the outline, then expand it, finally polish the prose")
                .expect("split");
        assert_eq!(method, SplitMethod::Conjunctions);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn semicolons_split() {
        let (method, parts) = split_task("port the parser; update the docs").expect("split");
        assert_eq!(method, SplitMethod::Semicolons);
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn single_thought_does_not_decompose() {
        assert!(split_task("Write a haiku about caches.").is_none());
    }

    #[test]
    fn coordination_is_the_last_resort() {
        let (method, parts) = split_task("Build backend and frontend and tests").expect("split");
        assert_eq!(method, SplitMethod::Coordination);
        assert_eq!(parts, vec!["Build backend", "frontend", "tests"]);
    }

    #[test]
    fn budget_shifts_on_keywords() {
        assert_eq!(
            adjust_budget("quick boilerplate endpoint", BudgetTier::Medium),
            BudgetTier::Low
        );
        assert_eq!(
            adjust_budget("security critical core", BudgetTier::Medium),
            BudgetTier::High
        );
        // Both kinds present: keep the base.
        assert_eq!(
            adjust_budget("simple but security sensitive", BudgetTier::Medium),
            BudgetTier::Medium
        );
    }

    #[test]
    fn classification_finds_the_majority() {
        assert_eq!(classify("refactor the api endpoint code"), Category::Coding);
        assert_eq!(classify("write a short story"), Category::Creative);
        assert_eq!(classify("tell me about the weather"), Category::General);
    }

    #[test]
    fn transitive_reduction_drops_shortcuts() {
        let edges = vec![(0, 1), (1, 2), (0, 2)];
        let reduced = transitive_reduction(3, edges);
        assert_eq!(reduced, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn cycle_detection_catches_loops() {
        assert!(is_acyclic(3, &[(0, 1), (1, 2)]));
        assert!(!is_acyclic(3, &[(0, 1), (1, 2), (2, 0)]));
    }

    #[test]
    fn waves_respect_max_parallel() {
        // Four independent nodes, two per wave.
        let waves = assign_waves(4, &[], 2);
        let mut sorted = waves.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 0, 1, 1]);
    }

    #[test]
    fn swarm_connects_implementation_to_tests() {
        let parts = vec![
            "Build backend".to_string(),
            "frontend".to_string(),
            "tests".to_string(),
        ];
        let (tasks, warning) =
            swarm_subtasks(&parts, SplitMethod::Coordination, BudgetTier::Medium, 4);
        assert!(warning.is_none());
        let test_task = tasks.iter().find(|t| t.text == "tests").expect("test task");
        assert_eq!(test_task.depends_on, vec![0, 1]);
        let backend_wave = tasks[0].wave;
        let frontend_wave = tasks[1].wave;
        assert!(test_task.wave >= backend_wave.max(frontend_wave));
    }

    #[test]
    fn cyclic_heuristics_fall_back_to_a_chain() {
        // Force a cycle by hand to exercise the guard.
        assert!(!is_acyclic(2, &[(0, 1), (1, 0)]));
        let (tasks, _) = swarm_subtasks(
            &vec!["a".to_string(), "b".to_string()],
            SplitMethod::Paragraphs,
            BudgetTier::Medium,
            4,
        );
        assert!(is_acyclic(
            tasks.len(),
            &tasks
                .iter()
                .flat_map(|t| t.depends_on.iter().map(|d| (*d, t.index)))
                .collect::<Vec<_>>()
        ));
    }
}
