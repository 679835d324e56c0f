//! Walks scenarios and decision trees on the terminal.

use crate::console::Console;
use anyhow::Result;
use loopweave_core::scenario::{ChoiceOption, TreeNode, ROOT_NODE};
use loopweave_core::{
    DecisionTree, OptionAction, ResolveContext, Scenario, ScenarioAction, Session, SyncStart,
    TrackId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CREDITS: &str = "~ the end ~  thanks for listening";

/// Drives a [`Session`] from listener input.
pub struct Director<'a> {
    session: &'a mut Session,
    console: &'a Console,
    shutdown: &'a AtomicBool,
}

/// What to do after a tree option was applied.
enum Flow {
    Stay,
    Goto(String),
    Restart,
}

impl<'a> Director<'a> {
    pub fn new(session: &'a mut Session, console: &'a Console, shutdown: &'a AtomicBool) -> Self {
        Self {
            session,
            console,
            shutdown,
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn read_line(&mut self) -> Option<String> {
        self.console.read_line(self.session, self.shutdown)
    }

    /// Let the loops run for `duration`. False when interrupted.
    fn run_for(&mut self, duration: Duration) -> bool {
        let shutdown = self.shutdown;
        self.session
            .run_for(duration, || shutdown.load(Ordering::Relaxed))
    }

    /// Play a linear scenario step by step.
    pub fn run_scenario(&mut self, scenario: &Scenario) -> Result<()> {
        for (index, action) in scenario.actions().iter().enumerate() {
            if self.interrupted() {
                return Ok(());
            }
            let context = ResolveContext::Step {
                index,
                actions: scenario.actions(),
            };

            match action {
                ScenarioAction::Play { audio } => {
                    println!("[{}] press Enter to play {}", index + 1, audio);
                    if self.read_line().is_none() {
                        return Ok(());
                    }
                    self.start(audio, &context);
                }
                ScenarioAction::Choose { options } => {
                    println!("[{}] choose:", index + 1);
                    for (n, option) in options.iter().enumerate() {
                        println!("  {}) {}", n + 1, option.label());
                    }
                    let Some(choice) = self.choose_option(options) else {
                        return Ok(());
                    };
                    self.start(&options[choice].audio, &context);
                }
                ScenarioAction::Wait { seconds } => {
                    let delay = scenario.wait_delay(
                        index,
                        *seconds,
                        self.session.elapsed_since_first_play(),
                    );
                    log::debug!("Waiting {:?} at step {}", delay, index + 1);
                    if !self.run_for(delay) {
                        return Ok(());
                    }
                }
                ScenarioAction::Stop { audio } => {
                    println!("[{}] press Enter to stop {}", index + 1, audio);
                    if self.read_line().is_none() {
                        return Ok(());
                    }
                    if !self.session.schedule_stop_after_loop(audio.as_str()) {
                        log::info!("{} is not playing", audio);
                    }
                }
                ScenarioAction::Unknown => {
                    log::debug!("Skipping unknown action at step {}", index + 1);
                }
            }
        }

        println!("End of scenario. Press Enter to let the loops finish.");
        if self.read_line().is_some() {
            self.finish();
        }
        Ok(())
    }

    fn choose_option(&mut self, options: &[ChoiceOption]) -> Option<usize> {
        if options.is_empty() {
            return None;
        }
        loop {
            let line = self.read_line()?;
            let labels: Vec<&str> = options.iter().map(|o| o.label()).collect();
            match parse_choice(&line, &labels) {
                Some(choice) => return Some(choice),
                None => println!("Enter a number between 1 and {}", options.len()),
            }
        }
    }

    fn start(&mut self, track: &TrackId, context: &ResolveContext<'_>) {
        match self.session.play_synced(track, context) {
            SyncStart::AlreadyPlaying => log::info!("{} is already playing", track),
            SyncStart::Immediate => log::info!("Starting {}", track),
            SyncStart::Synced { reference, target } => {
                let wait = target.saturating_duration_since(self.session.now());
                log::info!("Starting {} with {} in {:?}", track, reference, wait);
            }
            SyncStart::Deferred { reference } => {
                log::info!("Starting {} on the next cycle of {}", track, reference);
            }
        }
    }

    /// Walk a decision tree from its root.
    pub fn run_tree(&mut self, tree: &DecisionTree, extension: &str) -> Result<()> {
        let mut current = ROOT_NODE.to_string();
        loop {
            let Some(node) = tree.node(&current) else {
                anyhow::bail!("Node \"{}\" does not exist", current);
            };

            if let Some(delay) = node.delay() {
                println!("...");
                if !self.run_for(delay) {
                    return Ok(());
                }
            }
            show_node(node, current == ROOT_NODE);

            if node.options.is_empty() {
                if !node.is_final {
                    log::warn!("Node \"{}\" has no options", current);
                }
                println!("Press Enter to let the loops finish.");
                if self.read_line().is_some() {
                    self.finish();
                }
                return Ok(());
            }

            let labels: Vec<&str> = node.options.iter().map(|o| o.text.as_str()).collect();
            let choice = loop {
                let Some(line) = self.read_line() else {
                    return Ok(());
                };
                match parse_choice(&line, &labels) {
                    Some(choice) => break choice,
                    None => println!("Enter a number between 1 and {}", labels.len()),
                }
            };

            let option = &node.options[choice];
            let flow = self.apply_option(option.actions(extension), option.next.as_deref(), tree);
            match flow {
                Flow::Stay => {}
                Flow::Goto(next) => current = next,
                Flow::Restart => {
                    self.session.stop_all_after_loop();
                    current = ROOT_NODE.to_string();
                }
            }
        }
    }

    fn apply_option(
        &mut self,
        actions: Vec<OptionAction>,
        next: Option<&str>,
        tree: &DecisionTree,
    ) -> Flow {
        let mut restart = false;
        for action in actions {
            match action {
                OptionAction::Play(track) => self.start(&track, &ResolveContext::Global),
                OptionAction::Stop(track) => {
                    if !self.session.schedule_stop_after_loop(track.as_str()) {
                        log::debug!("{} is not playing", track);
                    }
                }
                OptionAction::Refresh => restart = true,
            }
        }

        if restart {
            return Flow::Restart;
        }
        match next {
            Some(next) if tree.node(next).is_some() => Flow::Goto(next.to_string()),
            Some(next) => {
                log::warn!("Option leads to unknown node \"{}\"", next);
                Flow::Stay
            }
            None => Flow::Stay,
        }
    }

    /// Stop every loop at its boundary and wait until all are silent.
    fn finish(&mut self) {
        loop {
            self.session.pump();
            self.session.stop_all_after_loop();
            let active = self
                .session
                .registry()
                .iter()
                .any(|l| l.is_playing() || l.is_starting());
            if !active || !self.run_for(Duration::from_millis(50)) {
                break;
            }
        }
        log::info!("All loops stopped");
    }
}

fn show_node(node: &TreeNode, is_root: bool) {
    println!();
    println!("{}", node.question);
    if !node.subheader.is_empty() {
        println!("{}", node.subheader);
    }
    for (n, option) in node.options.iter().enumerate() {
        println!("  {}) {}", n + 1, option.text);
    }
    if node.is_final {
        println!();
        println!("{}", CREDITS);
    }
    if is_root {
        println!();
        println!("(make sure the sound is on)");
    }
}

/// Parse a 1-based option number, or an option label (case-insensitive).
fn parse_choice(line: &str, labels: &[&str]) -> Option<usize> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(n) = line.parse::<usize>() {
        return (1..=labels.len()).contains(&n).then(|| n - 1);
    }
    labels
        .iter()
        .position(|label| label.eq_ignore_ascii_case(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopweave_core::{PlaybackResource, ResourceEvents, SyncPolicy, SystemClock};

    struct Silent;

    impl PlaybackResource for Silent {
        fn begin_load(&mut self) {}
        fn seek_to_start(&mut self) {}
        fn play(&mut self) {}
        fn pause(&mut self) {}
    }

    /// Session whose tracks report a fixed duration as soon as they are created.
    fn session(duration: Duration, policy: SyncPolicy) -> Session {
        let mut session = Session::new(
            SystemClock::new(),
            move |track: &TrackId, events: ResourceEvents| -> Box<dyn PlaybackResource> {
                events.metadata_loaded(track, Some(duration));
                Box::new(Silent)
            },
        );
        session.set_resolver(policy.resolver());
        session
    }

    fn console(lines: &[&str]) -> Console {
        let (tx, rx) = crossbeam_channel::unbounded();
        for line in lines {
            tx.send(line.to_string()).unwrap();
        }
        Console::from_receiver(rx)
    }

    #[test]
    fn test_parse_choice() {
        let labels = ["Forest", "Sea"];
        assert_eq!(parse_choice("1", &labels), Some(0));
        assert_eq!(parse_choice(" 2 ", &labels), Some(1));
        assert_eq!(parse_choice("3", &labels), None);
        assert_eq!(parse_choice("0", &labels), None);
        assert_eq!(parse_choice("sea", &labels), Some(1));
        assert_eq!(parse_choice("", &labels), None);
    }

    #[test]
    fn test_run_scenario() {
        let scenario = Scenario::from_json(
            r#"[
                {"action": "play", "audio": "drone.wav"},
                {"action": "choose", "options": [{"audio": "perc.wav"}, {"audio": "pad.wav"}]},
                {"action": "wait", "seconds": 0.05},
                {"action": "stop", "audio": "drone.wav"}
            ]"#,
        )
        .unwrap();
        let mut session = session(Duration::from_millis(200), SyncPolicy::NearestPriorStep);
        let console = console(&["", "2", "", ""]);
        let shutdown = AtomicBool::new(false);

        Director::new(&mut session, &console, &shutdown)
            .run_scenario(&scenario)
            .unwrap();

        assert!(session.get("perc.wav").is_none());
        let drone = session.get("drone.wav").unwrap();
        let pad = session.get("pad.wav").unwrap();
        assert!(drone.cycles_started() >= 1);
        assert!(pad.cycles_started() >= 1);
        assert!(session.playing_tracks().is_empty());
    }

    #[test]
    fn test_run_tree() {
        let tree = DecisionTree::from_json(
            r#"[{
                "1": {"question": "Where to?",
                      "options": [{"text": "Nowhere", "next": "404"},
                                  {"text": "Forest", "action": "+forest", "next": "2"}]},
                "2": {"question": "Listen", "final": true}
            }]"#,
        )
        .unwrap();
        let mut session = session(Duration::from_millis(100), SyncPolicy::GlobalLatest);
        let console = console(&["1", "forest", ""]);
        let shutdown = AtomicBool::new(false);

        Director::new(&mut session, &console, &shutdown)
            .run_tree(&tree, ".wav")
            .unwrap();

        let forest = session.get("forest.wav").unwrap();
        assert!(forest.cycles_started() >= 1);
        assert!(!forest.is_playing());
    }

    #[test]
    fn test_refresh_returns_to_root() {
        let tree = DecisionTree::from_json(
            r#"[{
                "1": {"question": "Start",
                      "options": [{"text": "Go", "action": "+a", "next": "2"},
                                  {"text": "Other", "action": "+b", "next": "2"}]},
                "2": {"question": "Again?", "final": true,
                      "options": [{"text": "Again", "action": "refresh"}]}
            }]"#,
        )
        .unwrap();
        let mut session = session(Duration::from_secs(10), SyncPolicy::GlobalLatest);
        // Go, Again, then Other: node "2" has a single option, so "2" is only
        // accepted once the walk is back at the root
        let console = console(&["1", "1", "2"]);
        let shutdown = AtomicBool::new(false);

        Director::new(&mut session, &console, &shutdown)
            .run_tree(&tree, ".wav")
            .unwrap();

        let a = session.get("a.wav").unwrap();
        assert!(a.is_playing());
        assert!(a.stop_requested());
        assert!(session.get("b.wav").is_some());
    }

    #[test]
    fn test_shutdown_stops_scenario() {
        let scenario = Scenario::from_json(r#"[{"action": "wait", "seconds": 60}]"#).unwrap();
        let mut session = session(Duration::from_millis(100), SyncPolicy::NearestPriorStep);
        let console = console(&[]);
        let shutdown = AtomicBool::new(true);

        Director::new(&mut session, &console, &shutdown)
            .run_scenario(&scenario)
            .unwrap();
        assert!(session.registry().is_empty());
    }
}
