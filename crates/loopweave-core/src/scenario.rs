//! Scenario documents.
//!
//! Two shapes of content drive a session:
//!
//! - [`Scenario`] - a linear list of [`ScenarioAction`]s (`play`, `choose`,
//!   `wait`, `stop`). The nearest-prior-step resolver scans it backwards.
//! - [`DecisionTree`] - question nodes whose options carry `;`-separated
//!   action strings (`+name` starts a loop, `-name` stops one, `refresh`
//!   restarts the story).
//!
//! # Example
//!
//! ```
//! use loopweave_core::scenario::Scenario;
//!
//! let scenario = Scenario::from_json(r#"[
//!     {"action": "play", "audio": "drone.wav"},
//!     {"action": "wait", "seconds": 8},
//!     {"action": "choose", "options": [{"audio": "perc.wav"}, {"audio": "pad.wav"}]}
//! ]"#).unwrap();
//! assert_eq!(scenario.len(), 3);
//! ```

use crate::error::{Error, Result};
use crate::resource::TrackId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Id of the node a decision tree starts from.
pub const ROOT_NODE: &str = "1";

/// One step of a linear scenario.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ScenarioAction {
    /// Start a loop (on user confirmation).
    Play { audio: TrackId },
    /// Let the user pick one of several loops.
    Choose { options: Vec<ChoiceOption> },
    /// Let time pass while the loops keep playing.
    Wait { seconds: f64 },
    /// Stop a loop at its next boundary (on user confirmation).
    Stop { audio: TrackId },
    /// Any action this player does not know; skipped.
    #[serde(other)]
    Unknown,
}

/// A selectable option of a `choose` step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    /// Track started when the option is picked.
    pub audio: TrackId,
    /// Optional label; the track id is shown when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ChoiceOption {
    /// Label to show for this option.
    pub fn label(&self) -> &str {
        self.text.as_deref().unwrap_or(self.audio.as_str())
    }
}

impl ScenarioAction {
    /// Tracks a `play` or `choose` step can start, in declaration order.
    pub fn tracks(&self) -> Vec<&TrackId> {
        match self {
            ScenarioAction::Play { audio } => vec![audio],
            ScenarioAction::Choose { options } => options.iter().map(|o| &o.audio).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this step starts loops.
    pub fn starts_loops(&self) -> bool {
        matches!(self, ScenarioAction::Play { .. } | ScenarioAction::Choose { .. })
    }
}

/// Linear scenario: an ordered list of actions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scenario {
    actions: Vec<ScenarioAction>,
}

impl Scenario {
    /// Build a scenario from actions.
    pub fn new(actions: Vec<ScenarioAction>) -> Self {
        Self { actions }
    }

    /// Parse a scenario from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let actions: Vec<ScenarioAction> = serde_json::from_str(text)?;
        Ok(Self { actions })
    }

    /// Load a scenario file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// All steps.
    pub fn actions(&self) -> &[ScenarioAction] {
        &self.actions
    }

    /// Step at `index`.
    pub fn get(&self, index: usize) -> Option<&ScenarioAction> {
        self.actions.get(index)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if the scenario has no steps.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Total scripted wait time before `step`.
    pub fn elapsed_before(&self, step: usize) -> Duration {
        self.actions
            .iter()
            .take(step)
            .filter_map(|action| match action {
                ScenarioAction::Wait { seconds } => Some(seconds_to_duration(*seconds)),
                _ => None,
            })
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// How long the `wait` at `step` should still last.
    ///
    /// Waits are anchored to the story timeline: the wait ends `seconds` after
    /// all previous scripted waits, measured from the first play
    /// (`since_start`). Before anything has played the wait lasts exactly
    /// `seconds`.
    pub fn wait_delay(&self, step: usize, seconds: f64, since_start: Option<Duration>) -> Duration {
        let own = seconds_to_duration(seconds);
        match since_start {
            Some(elapsed) => self
                .elapsed_before(step)
                .saturating_add(own)
                .saturating_sub(elapsed),
            None => own,
        }
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// A question node of a decision tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Main text.
    #[serde(default)]
    pub question: String,
    /// Secondary text shown under the question.
    #[serde(default)]
    pub subheader: String,
    /// Answers leading onwards.
    #[serde(default)]
    pub options: Vec<TreeOption>,
    /// Waiting time in milliseconds before the node is shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
    /// Whether this node ends the story.
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

impl TreeNode {
    /// Waiting time before the node is shown, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| seconds_to_duration(ms / 1000.0))
    }
}

/// An answer of a tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeOption {
    /// Button text.
    pub text: String,
    /// `;`-separated action string, see [`OptionAction::parse_all`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Node to go to afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl TreeOption {
    /// Parsed actions of this option.
    pub fn actions(&self, extension: &str) -> Vec<OptionAction> {
        self.action
            .as_deref()
            .map(|text| OptionAction::parse_all(text, extension))
            .unwrap_or_default()
    }
}

/// A single effect of choosing a tree option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionAction {
    /// Start a loop unless it is already playing.
    Play(TrackId),
    /// Stop a loop at its next boundary.
    Stop(TrackId),
    /// Restart the story from the root node.
    Refresh,
}

impl OptionAction {
    /// Parse an action string such as `"+drums; -pad"`.
    ///
    /// Track names get `extension` appended unless they already end with it.
    /// Empty and unrecognised parts are skipped.
    pub fn parse_all(text: &str, extension: &str) -> Vec<OptionAction> {
        text.split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| {
                if part == "refresh" {
                    Some(OptionAction::Refresh)
                } else if let Some(name) = part.strip_prefix('+') {
                    Some(OptionAction::Play(track_with_extension(name.trim(), extension)))
                } else if let Some(name) = part.strip_prefix('-') {
                    Some(OptionAction::Stop(track_with_extension(name.trim(), extension)))
                } else {
                    log::warn!("[SCENARIO] Unknown option action '{}'", part);
                    None
                }
            })
            .collect()
    }
}

fn track_with_extension(name: &str, extension: &str) -> TrackId {
    if extension.is_empty() || name.ends_with(extension) {
        TrackId::new(name)
    } else {
        TrackId::new(format!("{name}{extension}"))
    }
}

/// Decision tree of question nodes keyed by node id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecisionTree {
    nodes: BTreeMap<String, TreeNode>,
}

impl DecisionTree {
    /// Build a tree from nodes.
    pub fn new(nodes: BTreeMap<String, TreeNode>) -> Self {
        Self { nodes }
    }

    /// Parse a tree document: a JSON array whose first element maps node ids to nodes.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut documents: Vec<BTreeMap<String, TreeNode>> = serde_json::from_str(text)?;
        if documents.is_empty() {
            return Err(Error::Scenario("tree document contains no node map".to_string()));
        }
        let nodes = documents.swap_remove(0);
        if !nodes.contains_key(ROOT_NODE) {
            return Err(Error::Scenario(format!("tree has no root node \"{ROOT_NODE}\"")));
        }
        Ok(Self { nodes })
    }

    /// Load a tree file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Node by id.
    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// The root node.
    pub fn root(&self) -> Option<&TreeNode> {
        self.node(ROOT_NODE)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Option targets that do not exist in the tree, as `(node, target)` pairs.
    pub fn dangling_links(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .flat_map(|(id, node)| {
                node.options
                    .iter()
                    .filter_map(|opt| opt.next.as_deref())
                    .filter(|next| !self.nodes.contains_key(*next))
                    .map(move |next| (id.as_str(), next))
            })
            .collect()
    }

    /// Iterate nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &TreeNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Render the tree as a Graphviz `digraph`.
    ///
    /// Final nodes are drawn as double octagons and numbered by the last two
    /// characters of their id. Edges are labelled with the option text
    /// followed by its actions.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph \"Decision Tree\" {\n");
        for (id, node) in &self.nodes {
            let (label, shape) = if node.is_final {
                (format!("Answer {}", answer_number(id)), "doubleoctagon")
            } else {
                (format!("Question {}", node.question), "box")
            };
            out.push_str(&format!(
                "    {} [label={} shape={}]\n",
                dot_quote(id),
                dot_quote(&label),
                shape
            ));
        }
        for (id, node) in &self.nodes {
            for option in &node.options {
                let Some(next) = option.next.as_deref() else {
                    continue;
                };
                let mut label = option.text.clone();
                if let Some(action) = option.action.as_deref() {
                    let parts: Vec<&str> = action.split(';').map(str::trim).collect();
                    label.push(' ');
                    label.push_str(&parts.join(", "));
                }
                out.push_str(&format!(
                    "    {} -> {} [label={}]\n",
                    dot_quote(id),
                    dot_quote(next),
                    dot_quote(&truncate(&label, 40))
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Answer number of a final node: the last two id characters without
/// surrounding zeros, so `"1.10"` becomes `"1"` and `"1.07"` becomes `"7"`.
fn answer_number(id: &str) -> String {
    let tail: String = {
        let chars: Vec<char> = id.chars().collect();
        chars[chars.len().saturating_sub(2)..].iter().collect()
    };
    tail.trim_matches('0').to_string()
}

fn dot_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
