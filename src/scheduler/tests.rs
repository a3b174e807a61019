//! Scheduler tests. Everything runs in paused tokio time against the
//! simulated game, except the embedded-script run, which uses the blocking
//! pool and therefore real time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::*;
use crate::bridge::ScriptHandle;
use crate::capability::sim::{ItemStack, World};
use crate::capability::{AddonState, SimulatedGame};
use crate::config::{CraftLoopConfig, EngineConfig, ErrorPolicy, OnError};
use crate::library::{LibraryError, MacroKind, MacroLibrary};
use crate::script::GameQuery;

fn setup(
    world: World,
    config: EngineConfig,
    macros: &[(&str, &str)],
) -> (Arc<SimulatedGame>, Scheduler) {
    let game = Arc::new(SimulatedGame::new(world));
    let library = MacroLibrary::new();
    for (name, text) in macros {
        let kind = if name.ends_with(".script") {
            MacroKind::Script
        } else {
            MacroKind::Native
        };
        let name = name.trim_end_matches(".script");
        library.insert(name, kind, *text).unwrap();
    }
    let scheduler = Scheduler::new(game.clone(), config, Arc::new(library));
    (game, scheduler)
}

fn with_macros(macros: &[(&str, &str)]) -> (Arc<SimulatedGame>, Scheduler) {
    setup(World::default(), EngineConfig::default(), macros)
}

fn secs(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64()
}

/* ---------- state machine ---------- */

#[test]
fn transition_table() {
    use ControlRequest as R;
    use ExecutionState as S;

    assert_eq!(transition(S::Idle, R::Start), Ok(S::Running));
    assert_eq!(transition(S::Running, R::Pause), Ok(S::PausedNow));
    assert_eq!(transition(S::Running, R::PauseAtLoop), Ok(S::PausedAtNextLoop));
    assert_eq!(transition(S::PausedAtNextLoop, R::LoopBoundary), Ok(S::PausedNow));
    assert_eq!(transition(S::PausedAtNextLoop, R::Resume), Ok(S::Running));
    assert_eq!(transition(S::Running, R::StopAtLoop), Ok(S::StoppedAtNextLoop));
    assert_eq!(transition(S::StoppedAtNextLoop, R::LoopBoundary), Ok(S::Stopped));
    assert_eq!(transition(S::PausedNow, R::Step), Ok(S::Running));
    assert_eq!(transition(S::PausedNow, R::Stop), Ok(S::Stopped));
    assert_eq!(transition(S::Stopped, R::Stop), Ok(S::Stopped));

    assert!(transition(S::Running, R::Step).is_err());
    assert!(transition(S::Running, R::Resume).is_err());
    assert!(transition(S::PausedNow, R::StopAtLoop).is_err());
    assert!(transition(S::Stopped, R::Resume).is_err());
    assert!(transition(S::Stopped, R::Start).is_err());
}

#[test]
fn step_request_pauses_again_after_one_step() {
    let control = ControlHandle::new();
    control.request(ControlRequest::Start).unwrap();
    control.request(ControlRequest::Pause).unwrap();
    control.request(ControlRequest::Step).unwrap();
    assert_eq!(control.state(), ExecutionState::Running);
    control.after_step();
    assert_eq!(control.state(), ExecutionState::PausedNow);
    control.request(ControlRequest::Resume).unwrap();
    control.after_step();
    assert_eq!(control.state(), ExecutionState::Running);
}

/* ---------- loops ---------- */

#[tokio::test(start_paused = true)]
async fn header_loop_runs_the_body_n_times() {
    let (_game, scheduler) = with_macros(&[("Body", "/loop 3\n/wait 1")]);
    let start = Instant::now();
    let handle = scheduler.start("Body", None).unwrap();
    let control = handle.control().clone();
    let report = handle.join().await.unwrap();

    assert_eq!(report.loop_crossings, 3);
    assert!(secs(start.elapsed()) >= 3.0);
    assert!(secs(start.elapsed()) < 3.5);
    assert!(!report.stopped_by_user);
    assert_eq!(control.state(), ExecutionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn header_loop_of_zero_skips_the_body() {
    let (game, scheduler) = with_macros(&[("Body", "/loop 0 <echo>\n/echo body\n/wait 1")]);
    let start = Instant::now();
    let report = scheduler.start("Body", None).unwrap().join().await.unwrap();
    assert_eq!(report.loop_crossings, 0);
    assert_eq!(game.echoes(), vec!["Loops complete"]);
    assert!(secs(start.elapsed()) < 0.5);
}

#[tokio::test(start_paused = true)]
async fn run_loop_rewrites_the_trailing_loop() {
    let (game, scheduler) = with_macros(&[("MyMacro", "/ac Observe\n/loop")]);
    let report = scheduler
        .start("MyMacro", Some(5))
        .unwrap()
        .join()
        .await
        .unwrap();

    // `/loop 5` repeats five more times.
    assert_eq!(game.count_commands("action Observe"), 6);
    assert_eq!(report.loop_crossings, 6);
}

#[tokio::test(start_paused = true)]
async fn loop_total_counts_passes() {
    let config = EngineConfig {
        loop_total: true,
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(World::default(), config, &[("m", "/ac Observe\n/loop 3")]);
    scheduler.start("m", None).unwrap().join().await.unwrap();
    assert_eq!(game.count_commands("action Observe"), 3);
}

#[tokio::test(start_paused = true)]
async fn run_loop_needs_a_loop_step() {
    let (_game, scheduler) = with_macros(&[("flat", "/ac Observe")]);
    let err = scheduler.start("flat", Some(2)).err().unwrap();
    assert!(matches!(err, MacroError::Unsupported { .. }));
}

#[tokio::test(start_paused = true)]
async fn inner_loop_resets_for_the_outer_loop() {
    let (game, scheduler) = with_macros(&[("n", "/echo a\n/loop 1\n/echo b\n/loop 1")]);
    scheduler.start("n", None).unwrap().join().await.unwrap();
    assert_eq!(game.echoes(), vec!["a", "a", "b", "a", "a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn loop_echo_reports_remaining_passes() {
    let config = EngineConfig {
        loop_echo: true,
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(World::default(), config, &[("m", "/wait 1\n/loop 2")]);
    scheduler.start("m", None).unwrap().join().await.unwrap();
    assert_eq!(
        game.echoes(),
        vec!["1 loops remaining", "0 loops remaining", "Loops complete"]
    );
}

#[tokio::test(start_paused = true)]
async fn craft_gate_ends_the_macro() {
    let (game, scheduler) = with_macros(&[("g", "/craft 2 <echo>\n/echo body\n/loop")]);
    let report = scheduler.start("g", None).unwrap().join().await.unwrap();
    assert_eq!(
        game.echoes(),
        vec![
            "1 crafts remaining",
            "body",
            "0 crafts remaining",
            "body",
            "Craft gate complete"
        ]
    );
    assert!(!report.stopped_by_user);
}

fn synthesis_world() -> World {
    let mut world = World::default();
    world
        .addons
        .insert("RecipeNote".into(), AddonState::Visible);
    world.addons.insert("Synthesis".into(), AddonState::Visible);
    world
}

#[tokio::test(start_paused = true)]
async fn craft_loop_repeats_the_synthesis() {
    let config = EngineConfig {
        craft_loop: CraftLoopConfig {
            echo: true,
            ..CraftLoopConfig::default()
        },
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(synthesis_world(), config, &[("Synth", "/ac Observe")]);
    let report = scheduler
        .start_craft_loop("synth", Some(2))
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(game.count_commands("click synthesize"), 2);
    assert_eq!(game.count_commands("action Observe"), 2);
    assert_eq!(
        game.echoes(),
        vec!["1 crafts remaining", "0 crafts remaining", "Craft gate complete"]
    );
    assert!(!report.stopped_by_user);
}

#[tokio::test(start_paused = true)]
async fn craft_loop_mid_synthesis_counts_the_current_craft() {
    let config = EngineConfig {
        craft_loop: CraftLoopConfig {
            from_recipe_note: false,
            ..CraftLoopConfig::default()
        },
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(synthesis_world(), config, &[("Synth", "/ac Observe")]);
    scheduler
        .start_craft_loop("Synth", Some(3))
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(game.count_commands("action Observe"), 3);
    assert_eq!(game.count_commands("click synthesize"), 2);
}

#[tokio::test(start_paused = true)]
async fn craft_loop_waits_for_the_synthesis_window() {
    let mut world = synthesis_world();
    world.addons.remove("Synthesis");
    let config = EngineConfig {
        craft_loop: CraftLoopConfig {
            max_wait_secs: 2,
            ..CraftLoopConfig::default()
        },
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(world, config, &[("Synth", "/ac Observe")]);
    let start = Instant::now();
    let err = scheduler
        .start_craft_loop("Synth", Some(1))
        .unwrap()
        .join()
        .await
        .unwrap_err();

    assert!(matches!(err, MacroError::ConditionTimeout { line: 4, .. }));
    assert!((2.0..2.5).contains(&secs(start.elapsed())));
    assert_eq!(game.count_commands("action Observe"), 0);
}

#[tokio::test(start_paused = true)]
async fn craft_loop_rejects_a_template_without_the_macro() {
    let config = EngineConfig {
        craft_loop: CraftLoopConfig {
            use_template: true,
            template: "/craft {{count}}\n/loop".into(),
            ..CraftLoopConfig::default()
        },
        ..EngineConfig::default()
    };
    let (_game, scheduler) = setup(World::default(), config, &[("Synth", "/ac Observe")]);
    let err = scheduler.start_craft_loop("Synth", Some(1)).unwrap_err();
    assert!(matches!(
        err,
        MacroError::Library(LibraryError::CraftLoop { .. })
    ));
}

/* ---------- waits, conditions, requirements ---------- */

#[tokio::test(start_paused = true)]
async fn require_times_out_after_maxwait() {
    let (_game, scheduler) = with_macros(&[("r", "/require \"Well Fed\" <maxwait.2>")]);
    let start = Instant::now();
    let err = scheduler.start("r", None).unwrap().join().await.unwrap_err();
    let waited = secs(start.elapsed());

    assert!(matches!(err, MacroError::ConditionTimeout { line: 1, .. }));
    assert!((2.0..2.5).contains(&waited), "waited {waited}");
}

#[tokio::test(start_paused = true)]
async fn require_passes_once_the_status_appears() {
    let (game, scheduler) = with_macros(&[("r", "/require \"Well Fed\"\n/echo fed")]);
    let handle = scheduler.start("r", None).unwrap();
    sleep(Duration::from_secs(1)).await;
    game.update(|w| w.statuses.push("Well Fed".into()));
    handle.join().await.unwrap();
    assert_eq!(game.echoes(), vec!["fed"]);
}

#[tokio::test(start_paused = true)]
async fn wait_range_stays_in_bounds() {
    let (_game, scheduler) = with_macros(&[("w", "/wait 1-2")]);
    for _ in 0..10 {
        let start = Instant::now();
        scheduler.start("w", None).unwrap().join().await.unwrap();
        let waited = secs(start.elapsed());
        assert!((1.0..=2.0).contains(&waited), "waited {waited}");
    }
}

#[tokio::test(start_paused = true)]
async fn condition_filter_skips_actions() {
    let world = World {
        condition: Some("Good".into()),
        ..World::default()
    };
    let (game, scheduler) = setup(
        world,
        EngineConfig::default(),
        &[(
            "c",
            "/ac Observe <condition.excellent>\n/ac Touch <condition.good,excellent>\n/ac Veneration <condition.!poor>",
        )],
    );
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(game.commands(), vec!["action Touch", "action Veneration"]);
}

fn categorized_world() -> World {
    World {
        crafting_actions: vec!["Basic Synthesis".into()],
        quality_actions: vec!["Basic Touch".into()],
        ..World::default()
    }
}

const CATEGORIZED: &str = "/ac Basic Synthesis\n/ac Basic Touch\n/ac Sprint";

#[tokio::test(start_paused = true)]
async fn craft_skip_drops_crafting_actions_outside_a_synthesis() {
    let (game, scheduler) = setup(
        categorized_world(),
        EngineConfig::default(),
        &[("c", CATEGORIZED)],
    );
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(game.commands(), vec!["action Sprint"]);

    let config = EngineConfig {
        craft_skip: false,
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(categorized_world(), config, &[("c", CATEGORIZED)]);
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(
        game.commands(),
        vec!["action Basic Synthesis", "action Basic Touch", "action Sprint"]
    );
}

#[tokio::test(start_paused = true)]
async fn quality_skip_drops_touches_at_full_hq_chance() {
    let world = World {
        condition: Some("Normal".into()),
        hq_chance: Some(100),
        ..categorized_world()
    };
    let (game, scheduler) = setup(world, EngineConfig::default(), &[("c", CATEGORIZED)]);
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(
        game.commands(),
        vec!["action Basic Synthesis", "action Sprint"]
    );

    game.update(|w| w.hq_chance = Some(99));
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(game.count_commands("action Basic Touch"), 1);
}

#[tokio::test(start_paused = true)]
async fn quality_skip_can_be_disabled() {
    let world = World {
        condition: Some("Normal".into()),
        hq_chance: Some(100),
        ..categorized_world()
    };
    let config = EngineConfig {
        quality_skip: false,
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(world, config, &[("c", CATEGORIZED)]);
    scheduler.start("c", None).unwrap().join().await.unwrap();
    assert_eq!(game.count_commands("action "), 3);
}

#[tokio::test(start_paused = true)]
async fn unknown_condition_fails_the_step() {
    let (game, scheduler) = with_macros(&[("c", "/echo first\n/ac Observe <condition.sparkly>")]);
    let err = scheduler.start("c", None).unwrap().join().await.unwrap_err();
    assert!(matches!(err, MacroError::Modifier { line: 2, .. }));
    assert_eq!(game.echoes(), vec!["first"]);
}

#[tokio::test(start_paused = true)]
async fn requirerepair_pauses_until_resumed() {
    let world = World {
        broken_gear: true,
        ..World::default()
    };
    let (game, scheduler) = setup(world, EngineConfig::default(), &[("r", "/requirerepair\n/echo after")]);
    let handle = scheduler.start("r", None).unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(handle.control().state(), ExecutionState::PausedNow);
    assert!(game.echoes().is_empty());
    assert_eq!(game.count_commands("error gear needs repair"), 1);

    game.update(|w| w.broken_gear = false);
    handle.control().resume().unwrap();
    let report = handle.join().await.unwrap();
    assert_eq!(game.echoes(), vec!["after"]);
    assert_eq!(report.soft_errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn smart_wait_waits_for_idle() {
    let config = EngineConfig {
        smart_wait: true,
        ..EngineConfig::default()
    };
    let world = World {
        busy: true,
        ..World::default()
    };
    let (game, scheduler) = setup(world, config, &[("s", "/ac Observe <wait.3>\n/echo done")]);
    let start = Instant::now();
    let handle = scheduler.start("s", None).unwrap();
    sleep(Duration::from_millis(1500)).await;
    assert!(game.echoes().is_empty());
    game.update(|w| w.busy = false);
    handle.join().await.unwrap();
    let waited = secs(start.elapsed());
    assert!((1.5..2.0).contains(&waited), "waited {waited}");
}

/* ---------- error policy ---------- */

#[tokio::test(start_paused = true)]
async fn soft_error_stops_by_default() {
    let (game, scheduler) = with_macros(&[("i", "/item \"Grade 8 Tincture\"\n/echo after")]);
    let err = scheduler.start("i", None).unwrap().join().await.unwrap_err();
    assert!(matches!(err, MacroError::Capability { line: 1, .. }));
    assert!(game.echoes().is_empty());
    assert_eq!(game.count_commands("error"), 1);
}

#[tokio::test(start_paused = true)]
async fn soft_error_can_continue() {
    let config = EngineConfig {
        on_error: ErrorPolicy::uniform(OnError::Continue),
        ..EngineConfig::default()
    };
    let mut inventory = std::collections::HashMap::new();
    inventory.insert(
        "Grade 8 Tincture".to_string(),
        ItemStack {
            nq: 1,
            hq: 0,
            usable: false,
        },
    );
    let world = World {
        inventory,
        ..World::default()
    };
    let (game, scheduler) = setup(
        world,
        config,
        &[("i", "/item \"Grade 8 Tincture\"\n/target Nobody\n/echo after")],
    );
    let report = scheduler.start("i", None).unwrap().join().await.unwrap();

    assert_eq!(game.echoes(), vec!["after"]);
    assert_eq!(report.soft_errors.len(), 2);
    assert!(report.soft_errors[0].contains("not available"));
    assert!(report.soft_errors[1].contains("target Nobody"));
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_ignore_the_continue_policy() {
    let config = EngineConfig {
        on_error: ErrorPolicy::uniform(OnError::Continue),
        ..EngineConfig::default()
    };
    let (game, scheduler) = setup(
        World::default(),
        config,
        &[("a", "/runmacro Ghost\n/echo after")],
    );
    let err = scheduler.start("a", None).unwrap().join().await.unwrap_err();
    assert!(!err.is_soft());
    assert!(matches!(err, MacroError::Library(_)));
    assert!(game.echoes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_maxwait_fails_the_step_cleanly() {
    let (game, scheduler) = with_macros(&[]);
    let mut step = parser::parse_step("/require \"Well Fed\"").unwrap().unwrap();
    step.modifiers.max_wait = Some(1e20);
    let echo = parser::parse_step("/echo after").unwrap().unwrap();
    let handle = scheduler.run_script("huge", Arc::new(MacroScript::new(vec![step, echo])));
    let err = handle.join().await.unwrap_err();
    assert!(matches!(
        err,
        MacroError::Modifier {
            line: 1,
            source: crate::error::ModifierError::OutOfRange { .. }
        }
    ));
    assert!(game.echoes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported() {
    let config = EngineConfig {
        max_timeout_retries: 2,
        action_ack_timeout_ms: 1000,
        ..EngineConfig::default()
    };
    let world = World {
        acknowledge_actions: false,
        ..World::default()
    };
    let (game, scheduler) = setup(world, config, &[("a", "/ac Observe")]);
    let err = scheduler.start("a", None).unwrap().join().await.unwrap_err();
    assert!(matches!(err, MacroError::RetryExhausted { attempts: 3, .. }));
    assert_eq!(game.count_commands("action Observe"), 3);
}

/* ---------- control ---------- */

#[tokio::test(start_paused = true)]
async fn pause_at_loop_waits_for_the_boundary() {
    let (game, scheduler) = with_macros(&[("p", "/wait 1\n/echo tick\n/loop")]);
    let handle = scheduler.start("p", None).unwrap();
    sleep(Duration::from_millis(500)).await;
    handle.control().pause_at_loop().unwrap();
    assert_eq!(handle.control().state(), ExecutionState::PausedAtNextLoop);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(handle.control().state(), ExecutionState::PausedNow);
    // The step in flight finished; nothing after the boundary ran.
    assert_eq!(game.echoes(), vec!["tick"]);

    handle.control().stop().unwrap();
    let report = handle.join().await.unwrap();
    assert!(report.stopped_by_user);
    assert_eq!(report.loop_crossings, 1);
}

#[tokio::test(start_paused = true)]
async fn stop_at_loop_finishes_the_pass() {
    let (game, scheduler) = with_macros(&[("p", "/wait 1\n/echo tick\n/loop")]);
    let handle = scheduler.start("p", None).unwrap();
    sleep(Duration::from_millis(500)).await;
    handle.control().stop_at_loop().unwrap();
    let report = handle.join().await.unwrap();
    assert!(report.stopped_by_user);
    assert_eq!(game.echoes(), vec!["tick"]);
}

#[tokio::test(start_paused = true)]
async fn step_advances_exactly_one_step() {
    let (game, scheduler) = with_macros(&[("s", "/echo a\n/echo b\n/echo c")]);
    let handle = scheduler.start("s", None).unwrap();
    handle.control().pause().unwrap();

    sleep(Duration::from_secs(1)).await;
    assert!(game.echoes().is_empty());

    handle.control().step().unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(game.echoes(), vec!["a"]);
    assert_eq!(handle.control().state(), ExecutionState::PausedNow);

    handle.control().resume().unwrap();
    let report = handle.join().await.unwrap();
    assert_eq!(game.echoes(), vec!["a", "b", "c"]);
    assert_eq!(report.steps_executed, 3);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_wait() {
    let (game, scheduler) = with_macros(&[("s", "/wait 10\n/echo never")]);
    let start = Instant::now();
    let handle = scheduler.start("s", None).unwrap();
    sleep(Duration::from_secs(1)).await;
    handle.control().stop().unwrap();
    let report = handle.join().await.unwrap();

    assert!(report.stopped_by_user);
    assert!(game.echoes().is_empty());
    assert!(secs(start.elapsed()) < 1.2);
}

#[tokio::test(start_paused = true)]
async fn control_after_the_end_is_rejected() {
    let (_game, scheduler) = with_macros(&[("s", "/echo a")]);
    let handle = scheduler.start("s", None).unwrap();
    let control = handle.control().clone();
    handle.join().await.unwrap();
    assert!(control.resume().is_err());
    assert!(control.pause().is_err());
    assert_eq!(control.stop(), Ok(ExecutionState::Stopped));
}

/* ---------- nested invocation ---------- */

#[tokio::test(start_paused = true)]
async fn runmacro_runs_the_inner_macro_then_waits() {
    let (game, scheduler) = with_macros(&[
        ("Outer", "/echo a\n/runmacro Inner <wait.2>\n/echo c"),
        ("Inner", "/echo b"),
    ]);
    let start = Instant::now();
    let report = scheduler.start("outer", None).unwrap().join().await.unwrap();
    assert_eq!(game.echoes(), vec!["a", "b", "c"]);
    assert!(secs(start.elapsed()) >= 2.0);
    assert_eq!(report.steps_executed, 4);
}

#[tokio::test(start_paused = true)]
async fn inner_loops_are_independent() {
    let (game, scheduler) = with_macros(&[
        ("Outer", "/runmacro Inner\n/echo outer\n/loop 1"),
        ("Inner", "/echo inner\n/loop 1"),
    ]);
    scheduler.start("Outer", None).unwrap().join().await.unwrap();
    assert_eq!(
        game.echoes(),
        vec!["inner", "inner", "outer", "inner", "inner", "outer"]
    );
}

#[tokio::test(start_paused = true)]
async fn stopping_the_inner_macro_resumes_the_outer() {
    let (game, scheduler) = with_macros(&[
        ("Outer", "/runmacro Inner\n/echo after"),
        ("Inner", "/wait 1\n/loop"),
    ]);
    let handle = scheduler.start("Outer", None).unwrap();
    sleep(Duration::from_millis(500)).await;

    let names: Vec<String> = handle
        .control()
        .invocations()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["Outer", "Inner"]);

    handle.control().stop_at_loop().unwrap();
    let report = handle.join().await.unwrap();
    assert!(!report.stopped_by_user);
    assert_eq!(game.echoes(), vec!["after"]);
}

#[tokio::test(start_paused = true)]
async fn direct_cycle_is_detected() {
    let (_game, scheduler) = with_macros(&[("X", "/runmacro x")]);
    let err = scheduler.start("X", None).unwrap().join().await.unwrap_err();
    match err {
        MacroError::CycleDetected { chain } => assert_eq!(chain, vec!["X", "x"]),
        other => panic!("expected a cycle, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn indirect_cycle_is_detected() {
    let (game, scheduler) = with_macros(&[
        ("X", "/echo x\n/runmacro Y"),
        ("Y", "/echo y\n/runmacro X"),
    ]);
    let handle = scheduler.start("X", None).unwrap();
    let control = handle.control().clone();
    let err = handle.join().await.unwrap_err();
    match err {
        MacroError::CycleDetected { chain } => assert_eq!(chain, vec!["X", "Y", "X"]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(game.echoes(), vec!["x", "y"]);
    assert_eq!(control.invocations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn runmacro_of_a_missing_macro_fails() {
    let (_game, scheduler) = with_macros(&[("X", "/runmacro Ghost")]);
    let err = scheduler.start("X", None).unwrap().join().await.unwrap_err();
    assert!(matches!(err, MacroError::Library(_)));
}

/* ---------- bridge ---------- */

#[tokio::test(start_paused = true)]
async fn bridge_alternates_with_the_engine() {
    let (game, scheduler) = with_macros(&[]);
    let trace = Arc::new(Mutex::new(Vec::new()));
    let seen = trace.clone();
    let observed = game.clone();

    let handle = scheduler.start_bridge("abc", move |script| async move {
        for command in ["/echo A", "/wait 1", "/echo B", "/echo C"] {
            seen.lock().unwrap().push(format!("yield {command}"));
            script.yield_command(command).await?;
            let echoed = observed.echoes().len();
            seen.lock().unwrap().push(format!("done {command} ({echoed})"));
        }
        Ok::<(), MacroError>(())
    });
    let report = handle.join().await.unwrap();

    assert_eq!(game.echoes(), vec!["A", "B", "C"]);
    assert_eq!(
        *trace.lock().unwrap(),
        vec![
            "yield /echo A",
            "done /echo A (1)",
            "yield /wait 1",
            "done /wait 1 (1)",
            "yield /echo B",
            "done /echo B (2)",
            "yield /echo C",
            "done /echo C (3)",
        ]
    );
    assert_eq!(report.steps_executed, 4);
    assert_eq!(report.macro_name, "abc");
}

#[tokio::test(start_paused = true)]
async fn bridge_reports_failed_steps_to_the_script() {
    let (game, scheduler) = with_macros(&[]);
    let handle = scheduler.start_bridge("s", |script| async move {
        if script.yield_command("/loop 3").await.is_ok() {
            script.yield_command("/echo unreachable").await?;
        }
        script.yield_command("/item Nothing").await?;
        script.yield_command("/echo after").await
    });
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, MacroError::Capability { .. }));
    assert!(game.echoes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bridge_rejects_unparsable_lines() {
    let (_game, scheduler) = with_macros(&[]);
    let handle = scheduler.start_bridge("s", |script| async move {
        script.yield_command("/ac Observe <bogus>").await
    });
    assert!(matches!(
        handle.join().await.unwrap_err(),
        MacroError::Parse(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn bridge_scripts_read_the_game() {
    let mut inventory = std::collections::HashMap::new();
    inventory.insert(
        "Tincture".to_string(),
        ItemStack {
            nq: 1,
            hq: 2,
            usable: true,
        },
    );
    let world = World {
        statuses: vec!["Well Fed".into()],
        condition: Some("Good".into()),
        quality: Some(1200),
        hq_chance: Some(42),
        broken_gear: true,
        target: Some("Mender".into()),
        inventory,
        ..World::default()
    };
    let (game, scheduler) = setup(world, EngineConfig::default(), &[]);
    let handle = scheduler.start_bridge("s", |script| async move {
        let view = script.game();
        if view.has_status("well fed") && view.needs_repair() {
            script.yield_command("/echo fed and broken").await?;
        }
        let line = format!(
            "/echo {} {} {}% {} {}/{}",
            view.crafting_condition().unwrap_or_default(),
            view.quality().unwrap_or_default(),
            view.query(&GameQuery::HqChance),
            view.current_target().unwrap_or_default(),
            view.item_count("tincture", true),
            view.item_count("tincture", false),
        );
        script.yield_command(&line).await
    });
    handle.join().await.unwrap();
    assert_eq!(game.echoes(), vec!["fed and broken", "Good 1200 42% Mender 2/3"]);
}

async fn tick_forever(script: ScriptHandle) -> Result<(), MacroError> {
    loop {
        script.yield_command("/wait 1").await?;
        script.yield_command("/echo tick").await?;
    }
}

#[tokio::test(start_paused = true)]
async fn bridge_stop_ends_the_script() {
    let (game, scheduler) = with_macros(&[]);
    let handle = scheduler.start_bridge("forever", tick_forever);
    sleep(Duration::from_millis(2500)).await;
    handle.control().stop().unwrap();
    let report = handle.join().await.unwrap();
    assert!(report.stopped_by_user);
    assert_eq!(game.echoes(), vec!["tick", "tick"]);
}

#[tokio::test]
async fn embedded_script_runs_through_the_bridge() {
    let (game, scheduler) = with_macros(&[(
        "helper.script",
        "log \"starting\"\nrepeat 2:\n    yield \"/echo x\"\nset c from game: \"condition\"\nif c == \"none\": yield \"/echo idle\"\nelse: yield \"/echo crafting\"\n",
    )]);
    let report = scheduler.start("Helper", None).unwrap().join().await.unwrap();
    assert_eq!(game.echoes(), vec!["x", "x", "idle"]);
    assert_eq!(report.steps_executed, 3);
}

#[tokio::test]
async fn scripts_cannot_be_run_with_a_loop_count() {
    let (_game, scheduler) = with_macros(&[("helper.script", "log \"hi\"")]);
    assert!(matches!(
        scheduler.start("helper", Some(3)).err(),
        Some(MacroError::Unsupported { .. })
    ));
}
