use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use headless_dom::core::dom::DocumentReadyState;
use headless_dom::core::network::FetchOptions;
use headless_dom::window::ConsoleLevel;
use headless_dom::{
    Browser, BrowserError, BrowserSettings, ClosureScriptEngine, EventListener, JSError, NetworkError,
    ScriptEngine, StaticResourceLoader, Viewport, Window,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::Value;

type Log = Arc<Mutex<Vec<String>>>;

/// A tiny command language standing in for JavaScript: every script is one
/// `command argument` line.
fn run_command(window: &Window, log: &Log, source: &str) -> Result<Value, JSError> {
    let (command, argument) = source.split_once(' ').unwrap_or((source, ""));
    let document = window.document();
    let dom_error = |e: headless_dom::DomError| JSError::Execution(e.to_string());
    match command {
        "title" => document.set_title(argument),
        "write" => document.write(argument).map_err(dom_error)?,
        "assign" => window.location().assign(argument).map_err(dom_error)?,
        "throw" => return Err(JSError::Execution(argument.to_string())),
        "later" => {
            let (ms, rest) = argument.split_once(' ').unwrap_or((argument, ""));
            let delay: u64 = ms.parse().map_err(|_| JSError::Execution(format!("bad delay {ms}")))?;
            let (inner, log, rest) = (window.clone(), log.clone(), rest.to_string());
            window.set_timeout(move || run_command(&inner, &log, &rest).map(|_| ()), delay);
        }
        "inject" => {
            let script = document.create_element("script").map_err(dom_error)?;
            script.set_attribute("src", argument).map_err(dom_error)?;
            if let Some(body) = document.body() {
                body.append_child(&script).map_err(dom_error)?;
            }
        }
        "listen-doc" | "listen-win" => {
            let (log, inner) = (log.clone(), window.clone());
            let listener = EventListener::new(move |event| {
                let state = inner.document().ready_state();
                log.lock().push(format!("{}:{state:?}", event.event_type()));
                Ok(())
            });
            if command == "listen-doc" {
                document.add_event_listener(argument, &listener, false);
            } else {
                window.add_event_listener(argument, &listener, false);
            }
        }
        _ => {}
    }
    Ok(Value::Null)
}

fn scripted(log: &Log) -> Arc<dyn ScriptEngine> {
    let log = log.clone();
    Arc::new(ClosureScriptEngine::new(move |window, source| {
        let source = source.trim();
        log.lock().push(source.to_string());
        run_command(window, &log, source)
    }))
}

fn browser_with(settings: BrowserSettings, loader: &Arc<StaticResourceLoader>, log: &Log) -> Browser {
    Browser::with_collaborators(settings, loader.clone(), scripted(log))
}

fn browser(loader: &Arc<StaticResourceLoader>, log: &Log) -> Browser {
    browser_with(BrowserSettings::default(), loader, log)
}

fn title_of(page: &headless_dom::BrowserPage) -> String {
    page.main_frame().document().map(|doc| doc.title()).unwrap_or_default()
}

#[tokio::test]
async fn test_goto_loads_document_to_complete() {
    let loader = Arc::new(
        StaticResourceLoader::new().with_html("https://example.com/", "<title>Home</title><p>hi</p>"),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();

    page.goto("https://example.com/").await.unwrap();

    assert_eq!(page.url(), "https://example.com/");
    assert_eq!(page.main_frame().ready_state(), DocumentReadyState::Complete);
    assert_eq!(title_of(&page), "Home");
}

#[tokio::test]
async fn test_failed_navigation_keeps_current_document() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", "<title>Home</title>")
            .with_failure(
                "https://example.com/down",
                NetworkError::Connection("refused".into()),
            ),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    let window = page.main_frame().window().unwrap();

    let missing = page.goto("/missing").await.unwrap_err();
    assert!(matches!(missing, BrowserError::Navigation { .. }), "{missing:?}");
    let down = page.goto("/down").await.unwrap_err();
    assert!(matches!(down, BrowserError::Navigation { .. }), "{down:?}");

    let current = page.main_frame().window().unwrap();
    assert!(current.ptr_eq(&window));
    assert!(!current.is_closed());
    assert_eq!(page.url(), "https://example.com/");
    assert_eq!(title_of(&page), "Home");
}

#[tokio::test]
async fn test_data_urls_follow_settings() {
    let loader = Arc::new(StaticResourceLoader::new());
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();

    page.goto("data:text/html,<title>Inline</title>").await.unwrap();
    assert_eq!(title_of(&page), "Inline");

    let refused = page.goto("data:application/pdf;base64,AAAA").await;
    assert!(matches!(refused, Err(BrowserError::Navigation { .. })));
    assert_eq!(title_of(&page), "Inline");

    let settings = BrowserSettings {
        allow_data_urls: false,
        ..BrowserSettings::default()
    };
    let page = browser_with(settings, &loader, &log).new_page().unwrap();
    let refused = page.goto("data:text/html,<title>Inline</title>").await;
    assert!(matches!(refused, Err(BrowserError::Navigation { .. })));
    assert!(page.url().starts_with("about:blank"));
}

#[tokio::test]
async fn test_text_documents_are_wrapped_in_pre() {
    let loader = Arc::new(StaticResourceLoader::new().with_resource(
        "https://example.com/notes.txt",
        "text/plain",
        "a < b",
    ));
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/notes.txt").await.unwrap();
    let pre = page
        .main_frame()
        .document()
        .unwrap()
        .query_selector("pre")
        .unwrap()
        .unwrap();
    assert_eq!(pre.text_content().as_deref(), Some("a < b"));
}

#[tokio::test]
async fn test_inline_scripts_run_before_parser_inserted_external_ones() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html(
                "https://example.com/",
                r#"<script>inline-1</script><script src="/a.js"></script><script>inline-2</script>"#,
            )
            .with_resource("https://example.com/a.js", "text/javascript", "external-a"),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    assert_eq!(*log.lock(), vec!["inline-1", "inline-2", "external-a"]);
    assert_eq!(loader.request_count("https://example.com/a.js"), 1);
}

#[tokio::test]
async fn test_abort_cancels_parser_script_still_loading() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", r#"<script src="/slow.js"></script><p>body</p>"#)
            .with_delayed(
                "https://example.com/slow.js",
                "text/javascript",
                "slow-ran",
                Duration::from_millis(200),
            ),
    );
    let log = Log::default();
    let browser = browser(&loader, &log);
    let page = browser.new_page().unwrap();

    let (outcome, in_flight) = tokio::join!(page.goto("https://example.com/"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let in_flight = page.main_frame().window().unwrap().pending_tasks();
        page.abort();
        in_flight
    });

    assert!(outcome.is_ok(), "{outcome:?}");
    assert_eq!(in_flight, 1);
    assert!(log.lock().is_empty(), "{:?}", log.lock());
    assert_eq!(page.main_frame().window().unwrap().pending_tasks(), 0);
    assert_eq!(page.main_frame().ready_state(), DocumentReadyState::Complete);
}

#[tokio::test]
async fn test_dom_content_loaded_precedes_load() {
    let loader = Arc::new(StaticResourceLoader::new().with_html(
        "https://example.com/",
        "<script>listen-doc DOMContentLoaded</script><script>listen-win load</script>",
    ));
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    let events: Vec<String> = log
        .lock()
        .iter()
        .filter(|entry| !entry.starts_with("listen"))
        .cloned()
        .collect();
    assert_eq!(events, vec!["DOMContentLoaded:Interactive", "load:Complete"]);
}

#[tokio::test]
async fn test_when_complete_waits_for_timers_and_late_scripts() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", "<script>later 100 inject /late.js</script>")
            .with_resource("https://example.com/late.js", "text/javascript", "later 500 title Late"),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    assert_eq!(title_of(&page), "");

    page.when_complete().await;

    assert_eq!(title_of(&page), "Late");
    let window = page.main_frame().window().unwrap();
    assert_eq!(window.pending_tasks(), 0);
    assert!(window.performance_now() >= 600.0);
}

#[tokio::test]
async fn test_iframes_get_their_own_frame() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", r#"<iframe src="/child.html"></iframe>"#)
            .with_html("https://example.com/child.html", "<title>Child</title>"),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    page.when_complete().await;

    let frames = page.frames();
    assert_eq!(frames.len(), 2);
    let child = &frames[1];
    assert!(!child.is_main_frame());
    assert_eq!(child.parent_frame().as_ref(), Some(page.main_frame()));
    assert_eq!(child.url(), "https://example.com/child.html");
    assert_eq!(child.document().unwrap().title(), "Child");

    let iframe = page
        .main_frame()
        .document()
        .unwrap()
        .query_selector("iframe")
        .unwrap()
        .unwrap();
    assert_eq!(iframe.content_document().unwrap().title(), "Child");

    iframe.remove();
    assert!(child.is_closed());
    assert_eq!(page.frames().len(), 1);
}

#[tokio::test]
async fn test_disabled_iframe_loading_leaves_blank_frame() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", r#"<iframe src="/child.html"></iframe>"#)
            .with_html("https://example.com/child.html", "<title>Child</title>"),
    );
    let settings = BrowserSettings {
        disable_iframe_page_loading: true,
        ..BrowserSettings::default()
    };
    let log = Log::default();
    let page = browser_with(settings, &loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    let frames = page.frames();
    assert_eq!(frames.len(), 2);
    assert!(frames[1].url().starts_with("about:blank"));
    assert_eq!(loader.request_count("https://example.com/child.html"), 0);
    assert!(page
        .console()
        .messages_at(ConsoleLevel::Warn)
        .iter()
        .any(|message| message.contains("Iframe page loading is disabled")));
}

#[tokio::test]
async fn test_location_assign_navigates_on_completion() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", "<script>assign /next.html</script>")
            .with_html("https://example.com/next.html", "<title>Next</title>"),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    assert_eq!(page.url(), "https://example.com/");

    page.when_complete().await;

    assert_eq!(page.url(), "https://example.com/next.html");
    assert_eq!(title_of(&page), "Next");
}

#[tokio::test]
async fn test_document_write_during_parse_inserts_after_script() {
    let loader = Arc::new(StaticResourceLoader::new().with_html(
        "https://example.com/",
        "<body><script>write <p id=w>written</p></script><p id=after></p></body>",
    ));
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    let doc = page.main_frame().document().unwrap();
    let written = doc.get_element_by_id("w").unwrap();
    assert_eq!(written.text_content().as_deref(), Some("written"));
    assert_eq!(written.next_element_sibling(), doc.get_element_by_id("after"));
}

#[tokio::test]
async fn test_document_write_after_load_runs_scripts_as_written() {
    let loader = Arc::new(StaticResourceLoader::new().with_html("https://example.com/", "<p>old</p>"));
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    let doc = page.main_frame().document().unwrap();
    doc.write("<div id=box>").unwrap();
    let container = doc.get_element_by_id("box").unwrap();
    doc.write("<script>title Written</script>").unwrap();

    assert_eq!(log.lock().clone(), vec!["title Written".to_string()]);
    assert_eq!(title_of(&page), "Written");
    assert!(container.is_connected());
    assert_eq!(container.first_element_child().unwrap().tag_name(), "SCRIPT");
    doc.close().unwrap();
    assert_eq!(doc.ready_state(), DocumentReadyState::Complete);
}

#[tokio::test]
async fn test_script_errors_reach_console_and_parsing_continues() {
    let loader = Arc::new(StaticResourceLoader::new().with_html(
        "https://example.com/",
        "<script>throw boom</script><p id=after>still here</p>",
    ));
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();

    assert!(page
        .console()
        .messages_at(ConsoleLevel::Error)
        .iter()
        .any(|message| message.contains("boom")));
    let doc = page.main_frame().document().unwrap();
    assert!(doc.get_element_by_id("after").is_some());
}

#[tokio::test]
async fn test_fetch_sends_context_cookies() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", "<p>app</p>")
            .with_resource("https://example.com/api", "application/json", r#"{"ok":true}"#),
    );
    let log = Log::default();
    let browser = browser(&loader, &log);
    let page = browser.new_page().unwrap();
    let context = page.context();
    context
        .cookie_jar()
        .set_cookie(&"https://example.com/".parse().unwrap(), "session=abc");
    page.goto("https://example.com/").await.unwrap();

    let window = page.main_frame().window().unwrap();
    let response = window.fetch("/api", FetchOptions::default()).await.unwrap();
    assert!(response.ok());
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["ok"], true);

    let request = loader
        .requests()
        .into_iter()
        .find(|request| request.url.path() == "/api")
        .unwrap();
    let cookie = request
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .map(|(_, value)| value.as_str());
    assert_eq!(cookie, Some("session=abc"));
}

#[tokio::test]
async fn test_page_abort_cancels_fetch_in_flight() {
    let loader = Arc::new(
        StaticResourceLoader::new()
            .with_html("https://example.com/", "<p>app</p>")
            .with_delayed(
                "https://example.com/slow",
                "text/plain",
                "late",
                Duration::from_secs(10),
            ),
    );
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    let window = page.main_frame().window().unwrap();

    let (result, _) = tokio::join!(window.fetch("/slow", FetchOptions::default()), async {
        tokio::task::yield_now().await;
        page.abort();
    });

    assert!(matches!(result, Err(NetworkError::Aborted(_))), "{result:?}");
    assert_eq!(window.pending_tasks(), 0);
}

#[tokio::test]
async fn test_viewport_change_fires_resize() {
    let loader = Arc::new(StaticResourceLoader::new());
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();
    let window = page.main_frame().window().unwrap();
    let resized = Arc::new(AtomicUsize::new(0));
    {
        let resized = resized.clone();
        window.add_event_listener(
            "resize",
            &EventListener::new(move |_| {
                resized.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        );
    }

    page.set_viewport(Viewport {
        width: 800,
        ..Viewport::default()
    });

    assert_eq!(resized.load(Ordering::SeqCst), 1);
    assert_eq!(window.inner_width(), 800);
    assert_eq!(page.viewport().width, 800);
}

#[tokio::test]
async fn test_set_content_replaces_document_markup() {
    let loader = Arc::new(StaticResourceLoader::new());
    let log = Log::default();
    let page = browser(&loader, &log).new_page().unwrap();

    page.set_content("<p>hello</p>").await.unwrap();

    assert_eq!(page.content(), "<html><head></head><body><p>hello</p></body></html>");
    assert_eq!(page.main_frame().ready_state(), DocumentReadyState::Complete);
}

#[tokio::test]
async fn test_local_storage_is_shared_within_a_context() {
    let loader = Arc::new(StaticResourceLoader::new().with_html("https://example.com/", "<p>app</p>"));
    let log = Log::default();
    let browser = browser(&loader, &log);
    let context = browser.new_incognito_context().unwrap();

    let first = context.new_page().unwrap();
    let second = context.new_page().unwrap();
    first.goto("https://example.com/").await.unwrap();
    second.goto("https://example.com/").await.unwrap();
    first
        .main_frame()
        .window()
        .unwrap()
        .local_storage()
        .set_item("k", "v");
    assert_eq!(
        second.main_frame().window().unwrap().local_storage().get_item("k"),
        Some("v".to_string())
    );

    let other = browser.new_incognito_context().unwrap().new_page().unwrap();
    other.goto("https://example.com/").await.unwrap();
    assert_eq!(other.main_frame().window().unwrap().local_storage().get_item("k"), None);
}

#[tokio::test]
async fn test_page_keeps_its_context_after_browser_handle_is_dropped() {
    let loader = Arc::new(StaticResourceLoader::new().with_html("https://example.com/", "<p>app</p>"));
    let log = Log::default();
    let page = {
        let browser = browser(&loader, &log);
        let page = browser.new_page().unwrap();
        page.context()
            .cookie_jar()
            .set_cookie(&"https://example.com/".parse().unwrap(), "kept=1");
        page
    };

    let context = page.context();
    assert!(!context.is_closed());
    assert_eq!(context.pages(), vec![page.clone()]);
    page.goto("https://example.com/").await.unwrap();
    assert_eq!(page.main_frame().document().unwrap().cookie(), "kept=1");

    page.close();
    assert!(context.is_closed());
    assert!(context.pages().is_empty());
}

#[tokio::test]
async fn test_closing_cascades_from_browser_to_pages() {
    let loader = Arc::new(StaticResourceLoader::new().with_html("https://example.com/", "<p>app</p>"));
    let log = Log::default();
    let browser = browser(&loader, &log);

    let context = browser.new_incognito_context().unwrap();
    let first = context.new_page().unwrap();
    let second = context.new_page().unwrap();
    assert_eq!(context.pages().len(), 2);
    first.close();
    assert!(!context.is_closed());
    second.close();
    assert!(context.is_closed());
    assert!(matches!(context.new_page(), Err(BrowserError::Closed(_))));

    let page = browser.new_page().unwrap();
    page.goto("https://example.com/").await.unwrap();
    let window = page.main_frame().window().unwrap();
    browser.close();

    assert!(page.is_closed());
    assert!(window.is_closed());
    assert!(matches!(page.goto("https://example.com/").await, Err(BrowserError::Closed(_))));
    assert!(matches!(browser.new_page(), Err(BrowserError::Closed(_))));
}
