//! Integration tests for fragment suppression and handler correlation
//!
//! Each test builds a small component tree, renders it through `Renderer`
//! and checks the bytes that reach the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rover_ssr::{
    ComponentDescriptor, DispatchOutcome, HandlerId, MemoryTransport, RenderConfig, RenderError,
    RenderRequest, Renderer, fingerprint,
};
use tokio_util::sync::CancellationToken;

const SAVE_FINGERPRINT: u32 = 0x34f7_3e1b;

fn renderer() -> Renderer {
    Renderer::from_config(&RenderConfig {
        redirect_key: Some("integration".to_string()),
        ..RenderConfig::default()
    })
    .unwrap()
}

async fn render(renderer: &mut Renderer, request: RenderRequest) -> (DispatchOutcome, String) {
    let (outcome, transport) = renderer
        .handle(request, MemoryTransport::new(), CancellationToken::new())
        .await
        .unwrap();
    (outcome, transport.body_string())
}

#[tokio::test]
async fn test_suppressed_sibling_contributes_nothing() {
    let mut renderer = renderer();
    let tree = renderer.tree_mut();
    let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
    let a = tree
        .attach(ComponentDescriptor::conditional("A", |_: usize| false), Some(root))
        .unwrap();
    let b = tree.attach(ComponentDescriptor::new("B"), Some(root)).unwrap();

    let mut f = tree.frame_builder();
    f.component(a).component(b);
    let frames = f.build().unwrap();
    tree.set_frames(root, frames).unwrap();

    let mut f = tree.frame_builder();
    f.open_element("div").text("A").close();
    let frames = f.build().unwrap();
    tree.set_frames(a, frames).unwrap();

    let mut f = tree.frame_builder();
    f.open_element("div").attribute("id", "b").text("B").close();
    let frames = f.build().unwrap();
    tree.set_frames(b, frames).unwrap();

    let (_, html) = render(&mut renderer, RenderRequest::page(root)).await;
    assert_eq!(html, "<div id=\"b\">B</div>");
}

#[tokio::test]
async fn test_fragment_request_renders_only_the_target() {
    let mut renderer = renderer();
    let tree = renderer.tree_mut();
    let layout = tree.scope().layout();
    let target = tree.scope().target();
    let page = tree
        .attach(ComponentDescriptor::new("Page").with_output(layout), None)
        .unwrap();
    let header = tree.attach(ComponentDescriptor::new("Header"), Some(page)).unwrap();
    let cart = tree
        .attach(ComponentDescriptor::new("Cart").with_output(target), Some(page))
        .unwrap();

    let mut f = tree.frame_builder();
    f.open_element("html")
        .open_element("body")
        .component(header)
        .component(cart)
        .close()
        .close();
    let frames = f.build().unwrap();
    tree.set_frames(page, frames).unwrap();

    let mut f = tree.frame_builder();
    f.open_element("header").text("Shop").close();
    let frames = f.build().unwrap();
    tree.set_frames(header, frames).unwrap();

    let mut f = tree.frame_builder();
    f.open_element("ul").attribute("id", "cart").text("3 items").close();
    let frames = f.build().unwrap();
    tree.set_frames(cart, frames).unwrap();

    let (_, full) = render(&mut renderer, RenderRequest::page(page)).await;
    assert_eq!(
        full,
        "<html><body><header>Shop</header><ul id=\"cart\">3 items</ul></body></html>"
    );

    let (_, fragment) = render(&mut renderer, RenderRequest::page(page).fragment()).await;
    assert_eq!(fragment, "<ul id=\"cart\">3 items</ul>");

    // The flag does not leak into the next request.
    let (_, again) = render(&mut renderer, RenderRequest::page(page)).await;
    assert_eq!(again, full);
}

#[tokio::test]
async fn test_fingerprint_dispatch_runs_handler_exactly_once() {
    assert_eq!(fingerprint("hx-post", "/save"), SAVE_FINGERPRINT);

    let mut renderer = renderer();
    let tree = renderer.tree_mut();
    let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
    let form = tree.attach(ComponentDescriptor::new("Form"), Some(root)).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    tree.register_handler(form, HandlerId(1), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut f = tree.frame_builder();
    f.component(form);
    let frames = f.build().unwrap();
    tree.set_frames(root, frames).unwrap();

    // Two buttons share the action value and the handler registration.
    let mut f = tree.frame_builder();
    f.open_element("button")
        .attribute("hx-post", "/save")
        .handler("onpost", HandlerId(1))
        .text("Save")
        .close()
        .open_element("button")
        .attribute("hx-post", "/save")
        .handler("onpost", HandlerId(1))
        .text("Save again")
        .close();
    let both = f.build().unwrap();
    tree.set_frames(form, both).unwrap();

    let (outcome, html) = render(&mut renderer, RenderRequest::page(root)).await;
    assert!(html.contains(&format!("data-handler=\"{}\"", SAVE_FINGERPRINT)));
    assert!(matches!(outcome, DispatchOutcome::Rendered { handler: None, .. }));

    let (outcome, _) = render(
        &mut renderer,
        RenderRequest::page(root).with_fingerprint(SAVE_FINGERPRINT),
    )
    .await;
    match outcome {
        DispatchOutcome::Rendered {
            handler: Some(binding),
            ..
        } => {
            assert_eq!(binding.component, form);
            assert_eq!(binding.handler, HandlerId(1));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Drop the first button; the second still carries the binding.
    let tree = renderer.tree_mut();
    let mut f = tree.frame_builder();
    f.open_element("button")
        .attribute("hx-post", "/save")
        .handler("onpost", HandlerId(1))
        .text("Save again")
        .close();
    let second_only = f.build().unwrap();
    tree.set_frames(form, second_only).unwrap();
    let (_, html) = render(
        &mut renderer,
        RenderRequest::page(root).with_fingerprint(SAVE_FINGERPRINT),
    )
    .await;
    assert_eq!(
        html,
        format!(
            "<button hx-post=\"/save\" data-handler=\"{}\">Save again</button>",
            SAVE_FINGERPRINT
        )
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stale_fingerprint_is_a_bad_request() {
    let mut renderer = renderer();
    let root = renderer
        .tree_mut()
        .attach(ComponentDescriptor::new("App"), None)
        .unwrap();

    let (outcome, html) = render(
        &mut renderer,
        RenderRequest::page(root).with_fingerprint(SAVE_FINGERPRINT),
    )
    .await;
    assert_eq!(
        outcome,
        DispatchOutcome::BadRequest {
            fingerprint: SAVE_FINGERPRINT
        }
    );
    assert!(html.is_empty());
}

#[tokio::test]
async fn test_ambiguous_binding_aborts_and_names_components() {
    let mut renderer = renderer();
    let tree = renderer.tree_mut();
    let root = tree.attach(ComponentDescriptor::new("App"), None).unwrap();
    let left = tree.attach(ComponentDescriptor::new("Left"), Some(root)).unwrap();
    let right = tree.attach(ComponentDescriptor::new("Right"), Some(root)).unwrap();
    for id in [left, right] {
        tree.register_handler(id, HandlerId(1), |_| {});
        let mut f = tree.frame_builder();
        f.open_element("form")
            .attribute("hx-post", "/save")
            .handler("onpost", HandlerId(1))
            .close();
        let frames = f.build().unwrap();
        tree.set_frames(id, frames).unwrap();
    }

    let err = renderer
        .handle(
            RenderRequest::page(root).with_fingerprint(SAVE_FINGERPRINT),
            MemoryTransport::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(!err.is_recoverable());
    match err {
        RenderError::AmbiguousCorrelation { components, .. } => {
            assert!(components.iter().any(|c| c.starts_with("App/Left")));
            assert!(components.iter().any(|c| c.starts_with("App/Right")));
        }
        other => panic!("unexpected error {:?}", other),
    }
}
