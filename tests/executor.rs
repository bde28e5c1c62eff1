mod support;

use serde_json::json;
use support::{FakeDriver, element, files_in, quiet_settings};
use webpilot::action::{Action, Command, ScrollDirection};
use webpilot::config::{DistillConfig, ExecutorConfig};
use webpilot::dom::{Distiller, Observation};
use webpilot::error::DriverError;
use webpilot::executor::Executor;
use webpilot::types::{ContextStore, ErrorCode};

fn search_page() -> FakeDriver {
    FakeDriver::new("https://shop.example/search", "Search").with_elements(vec![
        element(0, "button", "Submit", "#submit", 100.0),
        element(1, "input", "", "input[name=\"q\"]", 50.0),
        element(2, "a", "Next page", "[data-agent-id=\"2\"]", 200.0),
    ])
}

async fn observe(driver: &FakeDriver) -> Observation {
    Distiller::new(DistillConfig::default())
        .distill(driver)
        .await
        .expect("fake page distills")
}

fn config(dir: &tempfile::TempDir) -> ExecutorConfig {
    quiet_settings(dir.path()).executor
}

#[tokio::test]
async fn ids_follow_reading_order() {
    let driver = search_page();
    let observation = observe(&driver).await;

    let addresses: Vec<&str> = observation
        .registry
        .iter()
        .map(|e| e.address.as_str())
        .collect();
    assert_eq!(addresses, ["input[name=\"q\"]", "#submit", "[data-agent-id=\"2\"]"]);
    assert!(observation.summary.contains("[2] BUTTON \"Submit\""));
}

#[tokio::test]
async fn ambiguous_address_falls_back_to_first_match_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    driver.duplicate("#submit", 2);
    let observation = observe(&driver).await;

    let click = Action::new("submit the form", Command::ClickElement { element_id: 2 });
    let result = Executor::new(&driver, &config)
        .execute(&click, &observation, &mut ContextStore::new())
        .await;

    assert!(result.success, "{}", result.message);
    assert!(result.message.ends_with("(used first match)"));
    let warning = result.warning.expect("warning is reported");
    assert!(warning.contains("matched 2 elements"), "{warning}");
    assert_eq!(driver.count_calls("click #submit"), 1);
}

#[tokio::test]
async fn unknown_element_id_never_reaches_the_browser() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    let observation = observe(&driver).await;

    let click = Action::new("", Command::ClickElement { element_id: 99 });
    let result = Executor::new(&driver, &config)
        .execute(&click, &observation, &mut ContextStore::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error, Some(ErrorCode::InvalidElementId));
    assert!(result.message.contains("fresh observation"));
    assert_eq!(driver.count_calls("click"), 0);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    driver.fail_clicks([DriverError::Transient("node detached".into())]);
    let observation = observe(&driver).await;

    let click = Action::new("", Command::ClickElement { element_id: 3 });
    let result = Executor::new(&driver, &config)
        .execute(&click, &observation, &mut ContextStore::new())
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(driver.count_calls("click"), 2);
    assert!(files_in(&config.diagnostics_dir).is_empty());
}

#[tokio::test]
async fn final_failure_writes_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    driver.fail_clicks([DriverError::Failed("element is covered".into())]);
    let observation = observe(&driver).await;

    let click = Action::new("", Command::ClickElement { element_id: 2 });
    let result = Executor::new(&driver, &config)
        .execute(&click, &observation, &mut ContextStore::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error, Some(ErrorCode::BrowserError));
    assert_eq!(driver.count_calls("click"), 1);

    let mut written: Vec<String> = files_in(&config.diagnostics_dir)
        .iter()
        .filter_map(|p| p.extension().map(|e| e.to_string_lossy().into_owned()))
        .collect();
    written.sort();
    assert_eq!(written, ["html", "png"]);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    driver.fail_clicks((0..config.max_attempts).map(|_| DriverError::Timeout("click".into())));
    let observation = observe(&driver).await;

    let click = Action::new("", Command::ClickElement { element_id: 2 });
    let result = Executor::new(&driver, &config)
        .execute(&click, &observation, &mut ContextStore::new())
        .await;

    assert_eq!(result.error, Some(ErrorCode::Timeout));
    assert_eq!(driver.count_calls("click"), config.max_attempts as usize);
}

#[tokio::test]
async fn navigation_refuses_script_urls_and_adds_https() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    let executor = Executor::new(&driver, &config);
    let observation = Observation::default();
    let mut context = ContextStore::new();

    let blocked = Action::new("", Command::Navigate { url: "javascript:alert(1)".into() });
    let result = executor.execute(&blocked, &observation, &mut context).await;
    assert_eq!(result.error, Some(ErrorCode::BlockedProtocol));
    assert_eq!(driver.count_calls("navigate"), 0);

    let bare = Action::new("", Command::Navigate { url: "example.com".into() });
    let result = executor.execute(&bare, &observation, &mut context).await;
    assert!(result.success);
    assert_eq!(driver.calls(), ["navigate https://example.com/"]);
}

#[tokio::test]
async fn typing_with_enter_presses_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    let observation = observe(&driver).await;

    let search = Action::new(
        "",
        Command::TypeText {
            element_id: 1,
            text: "rust books".into(),
            press_enter: true,
        },
    );
    let result = Executor::new(&driver, &config)
        .execute(&search, &observation, &mut ContextStore::new())
        .await;

    assert!(result.success);
    assert_eq!(
        driver.calls(),
        ["type input[name=\"q\"] rust books", "key Enter"]
    );
}

#[tokio::test]
async fn context_and_queries_stay_off_the_browser() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    let observation = observe(&driver).await;
    let executor = Executor::new(&driver, &config);
    let mut context = ContextStore::new();

    let store = Action::from_wire(&json!({
        "tool": "store_context",
        "args": {"key": "price", "value": "$12"}
    }))
    .unwrap();
    assert!(executor.execute(&store, &observation, &mut context).await.success);
    assert_eq!(context.get("price"), Some(&json!("$12")));

    let query = Action::new("", Command::QueryDom { query: "submit, checkout".into() });
    let result = executor.execute(&query, &observation, &mut context).await;
    assert!(result.success);
    let data = result.data.expect("query returns matches");
    assert_eq!(data["matches"][0]["keyword"], "submit");
    assert_eq!(data["matches"][0]["total_count"], 1);

    let missing = Action::new("", Command::QueryDom { query: "refund".into() });
    let result = executor.execute(&missing, &observation, &mut context).await;
    assert_eq!(result.error, Some(ErrorCode::NotFound));

    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn screenshots_land_in_the_screenshot_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();

    let shot = Action::new("", Command::TakeScreenshot);
    let result = Executor::new(&driver, &config)
        .execute(&shot, &Observation::default(), &mut ContextStore::new())
        .await;

    assert!(result.success, "{}", result.message);
    let path = result.data.expect("path is returned")["path"]
        .as_str()
        .map(std::path::PathBuf::from)
        .unwrap();
    assert!(path.starts_with(&config.screenshot_dir));
    assert!(path.exists());
}

#[tokio::test]
async fn failed_scroll_writes_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let driver = search_page();
    driver.fail_scrolls([DriverError::Failed("page crashed".into())]);

    let scroll = Action::new("", Command::ScrollPage { direction: ScrollDirection::Down });
    let result = Executor::new(&driver, &config)
        .execute(&scroll, &Observation::default(), &mut ContextStore::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.error, Some(ErrorCode::BrowserError));
    assert_eq!(driver.count_calls("scroll"), 1);
    assert_eq!(files_in(&config.diagnostics_dir).len(), 2);
}
