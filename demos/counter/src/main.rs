use std::thread;

use repose_devtools::{ChangeLog, Inspector};
use repose_runtime::prelude::*;
use web_time::Duration;

fn app(
    count: StateCell<i32>,
    history: StateCell<Vec<i32>>,
) -> impl FnMut(&mut Composer<'_, String>) -> Result<(), ComposeError> + 'static {
    move |cx| {
        let n = cx.read(&count)?;
        cx.emit("title", format!("Count: {n}"));

        let history = history.clone();
        cx.emit_with_content("history", "History".to_string(), move |cx| {
            for value in cx.read(&history)? {
                cx.emit(value, format!("was {value}"));
            }
            Ok(())
        })?;

        cx.launched_effect(|| {
            log::info!("counter mounted");
            on_unmount(|| log::info!("counter unmounted"))
        });
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let store = SnapshotStore::new();
    let global = store.global_snapshot();
    let count = StateCell::new(&global, 0)?;
    let history = StateCell::new(&global, Vec::<i32>::new())?;

    let recomposer = Recomposer::new(&store);
    let changes = ChangeLog::attach(&store, 64);
    let mut composition = Composition::new(&recomposer, MemoryApplier::new());
    let mut inspector = Inspector::new();
    inspector.hud.toggle_inspector();

    let report = composition.compose_initial(app(count.clone(), history.clone()))?;
    inspector.frame(&report);
    print!("{}", composition.applier().dump());

    let ticker = {
        let (store, count, history) = (store.clone(), count.clone(), history.clone());
        thread::spawn(move || -> anyhow::Result<()> {
            for _ in 0..3 {
                thread::sleep(std::time::Duration::from_millis(20));
                store.with_mutable_snapshot(|s| -> anyhow::Result<()> {
                    let previous = count.get_untracked(s)?;
                    count.set_untracked(s, previous + 1)?;
                    history.update_untracked(s, |h| h.insert(0, previous))?;
                    Ok(())
                })??;
            }
            Ok(())
        })
    };

    let mut frames = 0;
    while frames < 3 && recomposer.wait_for_work(Duration::from_secs(2)) {
        let report = composition.perform_recompose()?;
        if report.is_empty() {
            continue;
        }
        frames += 1;
        if let Some(overlay) = inspector.frame(&report) {
            println!("-- {overlay}");
        }
        print!("{}", composition.applier().dump());
    }

    ticker
        .join()
        .map_err(|_| anyhow::anyhow!("ticker thread panicked"))??;

    print!("{}", inspector.scope_tree(&composition));
    println!("{} state changes recorded", changes.len());
    for failure in composition.dispose() {
        log::error!("dispose: {}", failure.message);
    }
    Ok(())
}
