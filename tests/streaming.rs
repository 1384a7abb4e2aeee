//! End-to-end streaming behavior: shell delivery, placeholders, patch
//! instructions, error fallbacks, abort, and backpressure.

use phloem::{
    render, Awaitable, BufferSink, ComponentOutput, ErrorKind, Node, RenderCallbacks,
    RenderOptions,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn page(children: Vec<Node>) -> Node {
    Node::element("main", &[], children)
}

#[derive(Clone, Default)]
struct Milestones {
    shell_ready: Rc<Cell<bool>>,
    all_ready: Rc<Cell<bool>>,
    errors: Rc<RefCell<Vec<String>>>,
}

impl Milestones {
    fn callbacks(&self) -> RenderCallbacks {
        let shell = self.shell_ready.clone();
        let all = self.all_ready.clone();
        let errors = self.errors.clone();
        RenderCallbacks::new()
            .on_shell_ready(move || shell.set(true))
            .on_all_ready(move || all.set(true))
            .on_error(move |err| {
                let n = {
                    let mut errors = errors.borrow_mut();
                    errors.push(err.to_string());
                    errors.len()
                };
                Some(format!("digest-{n}"))
            })
    }
}

#[test]
fn sync_tree_renders_and_closes_in_one_pass() {
    let tree = page(vec![
        Node::element("h1", &[], vec![Node::text("title")]),
        Node::element("p", &[("class", "lede")], vec![Node::text("body")]),
    ]);
    let milestones = Milestones::default();
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), milestones.callbacks());

    // Both milestones settle in the initial synchronous pass.
    assert!(milestones.shell_ready.get());
    assert!(milestones.all_ready.get());

    handle.start_flowing(Box::new(sink.clone()));
    let out = sink.contents_utf8();
    assert_eq!(
        out,
        "<main><h1>title</h1><p class=\"lede\">body</p></main>"
    );
    assert!(!out.contains("<template"));
    assert!(!out.contains("<script>"));
    assert!(handle.is_complete());
    assert!(sink.is_closed());
}

#[test]
fn sync_boundary_flushes_inline_with_framing() {
    let tree = page(vec![Node::suspense(
        vec![Node::text("loading")],
        vec![Node::element("p", &[], vec![Node::text("ready")])],
    )]);
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), RenderCallbacks::new());
    handle.start_flowing(Box::new(sink.clone()));

    let out = sink.contents_utf8();
    // The boundary markers stay on the wire even though nothing suspended;
    // the fallback does not.
    assert_eq!(out, "<main><!--$--><p>ready</p><!--/$--></main>");
    assert!(handle.is_complete());
}

#[test]
fn suspended_boundary_streams_placeholder_then_patch() {
    init_tracing();
    let awaitable = Awaitable::new();
    let tree = page(vec![Node::suspense(
        vec![Node::text("loading")],
        vec![Node::async_node(awaitable.clone())],
    )]);
    let milestones = Milestones::default();
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), milestones.callbacks());

    assert!(milestones.shell_ready.get());
    assert!(!milestones.all_ready.get());

    handle.start_flowing(Box::new(sink.clone()));
    let shell = sink.contents_utf8();
    assert!(shell.contains("<!--$?--><template id=\"B:0\"></template>loading<!--/$-->"));
    assert!(!handle.is_complete());

    awaitable.resolve(Node::element("p", &[], vec![Node::text("arrived")]));
    handle.perform_work();

    let out = sink.contents_utf8();
    let patch = &out[shell.len()..];
    assert!(patch.contains("<div hidden id=\"S:0\"><p>arrived</p></div>"));
    assert!(patch.contains("$RC(\"B:0\",\"S:0\")"));
    assert!(milestones.all_ready.get());
    assert!(handle.is_complete());
    assert!(sink.is_closed());
}

#[test]
fn sync_error_in_boundary_streams_fallback_with_digest() {
    let tree = page(vec![Node::suspense(
        vec![Node::text("fallback")],
        vec![Node::component("Broken", |_scope| {
            ComponentOutput::Failed(phloem::RenderError::component("kaput"))
        })],
    )]);
    let milestones = Milestones::default();
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), milestones.callbacks());
    handle.start_flowing(Box::new(sink.clone()));

    let out = sink.contents_utf8();
    assert!(out.contains("<!--$!--><template data-dgst=\"digest-1\"></template>fallback<!--/$-->"));
    assert_eq!(milestones.errors.borrow().len(), 1);
    assert!(milestones.errors.borrow()[0].contains("kaput"));
    assert!(handle.is_complete());
}

#[test]
fn late_rejection_emits_client_render_instruction() {
    let awaitable = Awaitable::new();
    let tree = page(vec![Node::suspense(
        vec![Node::text("fallback")],
        vec![Node::async_node(awaitable.clone())],
    )]);
    let milestones = Milestones::default();
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), milestones.callbacks());
    handle.start_flowing(Box::new(sink.clone()));

    let shell = sink.contents_utf8();
    assert!(shell.contains("<!--$?--><template id=\"B:0\"></template>fallback<!--/$-->"));

    awaitable.reject(phloem::RenderError::component("fetch failed"));
    handle.perform_work();

    let out = sink.contents_utf8();
    let patch = &out[shell.len()..];
    assert!(patch.contains("$RX(\"B:0\",\"digest-1\")"));
    assert_eq!(milestones.errors.borrow().len(), 1);
    assert!(handle.is_complete());
}

#[test]
fn abort_is_idempotent_and_client_renders_pending_boundaries() {
    let awaitable = Awaitable::new();
    let tree = page(vec![Node::suspense(
        vec![Node::text("fallback")],
        vec![Node::async_node(awaitable.clone())],
    )]);
    let milestones = Milestones::default();
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), milestones.callbacks());
    handle.start_flowing(Box::new(sink.clone()));

    handle.abort(Some("deadline"));
    let after_first = sink.contents_utf8();
    assert!(after_first.contains("$RX(\"B:0\",\"digest-1\")"));
    assert!(handle.is_complete());

    handle.abort(Some("again"));
    handle.perform_work();
    assert_eq!(sink.contents_utf8(), after_first);
    assert_eq!(milestones.errors.borrow().len(), 1);

    // Settling the awaitable after the abort changes nothing.
    awaitable.resolve(Node::text("too late"));
    handle.perform_work();
    assert_eq!(sink.contents_utf8(), after_first);
}

#[test]
fn backpressure_resumes_each_boundary_exactly_once_in_order() {
    init_tracing();
    let first = Awaitable::new();
    let second = Awaitable::new();
    let third = Awaitable::new();
    let boundary = |aw: &Awaitable, label: &str| {
        Node::suspense(
            vec![Node::text(label)],
            vec![Node::async_node(aw.clone())],
        )
    };
    let tree = page(vec![
        boundary(&first, "one"),
        boundary(&second, "two"),
        boundary(&third, "three"),
    ]);
    let sink = BufferSink::with_capacity_budget(1);
    let options = RenderOptions::new().with_sink_buffer_size(16);
    let mut handle = render(tree, options, RenderCallbacks::new());
    handle.start_flowing(Box::new(sink.clone()));

    // Completion order deliberately differs from document order.
    third.resolve(Node::text("c"));
    first.resolve(Node::text("a"));
    second.resolve(Node::text("b"));

    let mut rounds = 0;
    while !handle.is_complete() {
        sink.refill(64);
        handle.perform_work();
        rounds += 1;
        assert!(rounds < 100, "flush did not make progress");
    }
    assert!(rounds > 1, "budget never exhausted; test is vacuous");

    let out = sink.contents_utf8();
    for id in ["B:0", "B:1", "B:2"] {
        let call = format!("\"{id}\"");
        assert_eq!(
            out.matches(&call).count(),
            2, // once in the placeholder template, once in the $RC call
            "boundary {id} flushed a wrong number of times"
        );
    }
    // Patch instructions appear in completion order, not document order.
    let pos = |needle: &str| out.find(needle).expect(needle);
    let rc2 = pos("$RC(\"B:2\"");
    let rc0 = pos("$RC(\"B:0\"");
    let rc1 = pos("$RC(\"B:1\"");
    assert!(rc2 < rc0 && rc0 < rc1);
}

#[test]
fn large_boundary_is_demoted_to_out_of_band_delivery() {
    let big_text = "x".repeat(256);
    let tree = page(vec![
        Node::suspense(
            vec![Node::text("loading")],
            vec![Node::element("p", &[], vec![Node::text(&big_text)])],
        ),
        Node::element("footer", &[], vec![Node::text("after")]),
    ]);
    let sink = BufferSink::new();
    let options = RenderOptions::new().with_progressive_chunk_size(64);
    let mut handle = render(tree, options, RenderCallbacks::new());
    handle.start_flowing(Box::new(sink.clone()));

    let out = sink.contents_utf8();
    // The oversized boundary ships its fallback inline so the footer is
    // not blocked, then completes out of band.
    assert!(out.contains("<!--$?--><template id=\"B:0\"></template>loading<!--/$-->"));
    let footer = out.find("<footer>after</footer>").expect("footer flushed");
    let patch = out.find("$RC(\"B:0\",\"S:0\")").expect("completion patch");
    assert!(footer < patch);
    assert!(out.contains(&big_text));
    assert!(handle.is_complete());
}

#[test]
fn adjacent_text_runs_are_separated_for_hydration() {
    let name = Node::component("Name", |_| ComponentOutput::Ready(Node::text("world")));
    let tree = Node::element("p", &[], vec![Node::text("hello "), name]);
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), RenderCallbacks::new());
    handle.start_flowing(Box::new(sink.clone()));
    assert_eq!(sink.contents_utf8(), "<p>hello <!-- -->world</p>");
    assert!(handle.is_complete());
}

#[test]
fn shell_error_fires_shell_and_fatal_callbacks() {
    let shell_err = Rc::new(Cell::new(false));
    let fatal = Rc::new(Cell::new(false));
    let shell_flag = shell_err.clone();
    let fatal_flag = fatal.clone();
    let callbacks = RenderCallbacks::new()
        .on_shell_error(move |_| shell_flag.set(true))
        .on_fatal_error(move |_| fatal_flag.set(true));

    let tree = page(vec![Node::component("Root", |_| {
        ComponentOutput::Failed(phloem::RenderError::component("no boundary above"))
    })]);
    let handle = render(tree, RenderOptions::new(), callbacks);

    assert!(shell_err.get());
    assert!(fatal.get());
    assert!(handle.fatal_error().is_some());
    assert!(!handle.is_complete());
}

#[test]
fn context_snapshot_survives_suspension() {
    let awaitable = Awaitable::new();
    let themed = Node::component("Themed", |scope| {
        let theme = scope.context.get("theme").unwrap_or("none").to_owned();
        ComponentOutput::Ready(Node::text(theme))
    });
    let tree = page(vec![Node::provider(
        "theme",
        "dark",
        vec![Node::suspense(
            vec![Node::text("loading")],
            vec![Node::async_node(awaitable.clone()), themed],
        )],
    )]);
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), RenderCallbacks::new());
    handle.start_flowing(Box::new(sink.clone()));

    // Resolve to a component that also reads the captured context.
    awaitable.resolve(Node::component("Late", |scope| {
        let theme = scope.context.get("theme").unwrap_or("none").to_owned();
        ComponentOutput::Ready(Node::text(format!("late-{theme}")))
    }));
    handle.perform_work();

    let out = sink.contents_utf8();
    assert!(out.contains("dark"));
    assert!(out.contains("late-dark"));
    assert!(handle.is_complete());
}

#[test]
fn rejected_awaitable_error_kind_reaches_reporter() {
    let kinds = Rc::new(RefCell::new(Vec::new()));
    let seen = kinds.clone();
    let callbacks = RenderCallbacks::new().on_error(move |err| {
        seen.borrow_mut().push(err.kind());
        None
    });
    let awaitable = Awaitable::new();
    awaitable.reject(phloem::RenderError::component("bad"));
    let tree = page(vec![Node::suspense(
        vec![Node::text("fb")],
        vec![Node::async_node(awaitable)],
    )]);
    let sink = BufferSink::new();
    let mut handle = render(tree, RenderOptions::new(), callbacks);
    handle.start_flowing(Box::new(sink.clone()));

    assert_eq!(kinds.borrow().as_slice(), &[ErrorKind::Component]);
    // No digest returned: the error template carries none.
    assert!(sink.contents_utf8().contains("<!--$!-->fb<!--/$-->"));
    assert!(handle.is_complete());
}
