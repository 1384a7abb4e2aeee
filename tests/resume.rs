//! The resumable-render round trip: deliberate deferral, the resume
//! token, and structural-mismatch degradation.

use phloem::{
    prerender, render, resume, Awaitable, BufferSink, ComponentOutput, ErrorKind, Node,
    RenderCallbacks, RenderOptions, ResumeSlot, ResumeToken,
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

/// A component that postpones until `ready` is set, then renders `text`.
fn deferrable(ready: &Rc<Cell<bool>>, text: &str) -> Node {
    let ready = ready.clone();
    let text = text.to_owned();
    Node::component("Deferred", move |_scope| {
        if ready.get() {
            ComponentOutput::Ready(Node::element("p", &[], vec![Node::text(&text)]))
        } else {
            ComponentOutput::Postpone
        }
    })
}

fn page(ready: &Rc<Cell<bool>>) -> Node {
    Node::element(
        "main",
        &[],
        vec![
            Node::element("h1", &[], vec![Node::text("static")]),
            Node::suspense(
                vec![Node::text("loading")],
                vec![deferrable(ready, "deferred content")],
            ),
        ],
    )
}

#[test]
fn prerender_records_deferral_and_resume_completes_it() {
    init_tracing();
    let ready = Rc::new(Cell::new(false));
    let postponed = Rc::new(RefCell::new(Vec::new()));
    let seen = postponed.clone();
    let callbacks =
        RenderCallbacks::new().on_postpone(move |kp| seen.borrow_mut().push(format!("{kp:?}")));

    let first = BufferSink::new();
    let mut pre = prerender(page(&ready), RenderOptions::new(), callbacks);
    pre.start_flowing(Box::new(first.clone()));
    assert!(pre.is_complete());
    assert_eq!(postponed.borrow().len(), 1);
    assert!(postponed.borrow()[0].contains("Suspense"));

    let shell = first.contents_utf8();
    assert!(shell.contains("<h1>static</h1>"));
    assert!(shell.contains("<!--$?--><template id=\"B:0\"></template>loading<!--/$-->"));
    assert!(!shell.contains("deferred content"));

    let token = pre.into_resume_token().expect("something was deferred");
    // The ledger addresses the boundary through its recorded tree path.
    let main_node = &token.replay_nodes()[0];
    assert_eq!(main_node.name.as_deref(), Some("main"));
    let suspense = &main_node.children[0];
    assert_eq!(suspense.name.as_deref(), Some("Suspense"));
    assert!(matches!(suspense.slot, ResumeSlot::Id(_)));

    // Round-trip the token through its wire form.
    let bytes = token.to_bytes().expect("encode");
    let wire = String::from_utf8(bytes.clone()).expect("utf8");
    assert!(wire.contains("\"nextSegmentId\""));
    assert!(wire.contains("\"replayNodes\""));
    let token = ResumeToken::from_bytes(&bytes).expect("decode");

    // Second pass: the same tree, now able to produce real content.
    ready.set(true);
    let second = BufferSink::new();
    let mut res = resume(
        page(&ready),
        token,
        RenderOptions::new(),
        RenderCallbacks::new(),
    );
    res.start_flowing(Box::new(second.clone()));
    assert!(res.is_complete());

    let patch = second.contents_utf8();
    assert!(patch.contains("deferred content"));
    assert!(patch.contains("$RC(\"B:0\",\"S:0\")"));
    // The shell is not re-emitted by the resumed pass.
    assert!(!patch.contains("<h1>"));

    // Everything a direct render would produce is present across the two
    // streams once the patches are applied.
    let ready_now = Rc::new(Cell::new(true));
    let direct_sink = BufferSink::new();
    let mut direct = render(
        page(&ready_now),
        RenderOptions::new(),
        RenderCallbacks::new(),
    );
    direct.start_flowing(Box::new(direct_sink.clone()));
    let direct_out = direct_sink.contents_utf8();
    assert!(direct_out.contains("<p>deferred content</p>"));
    assert!(patch.contains("<p>deferred content</p>"));
}

#[test]
fn resume_instructions_skip_already_sent_function_bodies() {
    // A boundary that fails in the prerender emits the client-render
    // script body there; a failure in the resumed pass must not repeat it.
    let ready = Rc::new(Cell::new(false));
    let tree = |ready: &Rc<Cell<bool>>| {
        Node::element(
            "main",
            &[],
            vec![
                Node::suspense(
                    vec![Node::text("fb-a")],
                    vec![deferrable(ready, "a")],
                ),
                Node::suspense(
                    vec![Node::text("fb-b")],
                    vec![deferrable(ready, "b")],
                ),
            ],
        )
    };

    let first = BufferSink::new();
    let mut pre = prerender(tree(&ready), RenderOptions::new(), RenderCallbacks::new());
    pre.start_flowing(Box::new(first.clone()));
    let token = pre.into_resume_token().expect("deferred");

    ready.set(true);
    let second = BufferSink::new();
    let mut res = resume(
        tree(&ready),
        token,
        RenderOptions::new(),
        RenderCallbacks::new(),
    );
    res.start_flowing(Box::new(second.clone()));

    let patch = second.contents_utf8();
    // Two completions, one function body.
    assert_eq!(patch.matches("$RC=function").count(), 1);
    assert_eq!(patch.matches("$RC(\"").count(), 2);
    assert!(res.is_complete());
}

#[test]
fn mismatched_resume_tree_degrades_to_client_rendering() {
    let ready = Rc::new(Cell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));

    let first = BufferSink::new();
    let mut pre = prerender(page(&ready), RenderOptions::new(), RenderCallbacks::new());
    pre.start_flowing(Box::new(first.clone()));
    let token = pre.into_resume_token().expect("deferred");

    // A structurally different tree: the recorded path no longer exists.
    let other_tree = Node::element("section", &[], vec![Node::text("different")]);
    let seen = errors.clone();
    let callbacks = RenderCallbacks::new().on_error(move |err| {
        seen.borrow_mut().push(err.kind());
        Some("mismatch-digest".to_owned())
    });
    let second = BufferSink::new();
    let mut res = resume(other_tree, token, RenderOptions::new(), callbacks);
    res.start_flowing(Box::new(second.clone()));

    let patch = second.contents_utf8();
    assert!(patch.contains("$RX(\"B:0\",\"mismatch-digest\")"));
    assert_eq!(errors.borrow().as_slice(), &[ErrorKind::ReplayMismatch]);
    assert!(res.is_complete());
}

#[test]
fn postpone_outside_resumable_render_is_a_boundary_error() {
    let ready = Rc::new(Cell::new(false));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let seen = errors.clone();
    let callbacks = RenderCallbacks::new().on_error(move |err| {
        seen.borrow_mut().push(err.kind());
        Some("d".to_owned())
    });

    let sink = BufferSink::new();
    let mut handle = render(page(&ready), RenderOptions::new(), callbacks);
    handle.start_flowing(Box::new(sink.clone()));

    let out = sink.contents_utf8();
    assert!(out.contains("<!--$!--><template data-dgst=\"d\"></template>loading<!--/$-->"));
    assert_eq!(errors.borrow().as_slice(), &[ErrorKind::PostponeOutsideResume]);
    assert!(handle.is_complete());
}

#[test]
fn postpone_at_the_root_is_a_fatal_configuration_error() {
    let fatal_kind = Rc::new(RefCell::new(None));
    let seen = fatal_kind.clone();
    let callbacks =
        RenderCallbacks::new().on_fatal_error(move |err| *seen.borrow_mut() = Some(err.kind()));

    let tree = Node::element(
        "main",
        &[],
        vec![Node::component("RootDeferral", |_| ComponentOutput::Postpone)],
    );
    let pre = prerender(tree, RenderOptions::new(), callbacks);

    assert_eq!(*fatal_kind.borrow(), Some(ErrorKind::PostponeAtRoot));
    assert_eq!(
        pre.fatal_error().map(phloem::RenderError::kind),
        Some(ErrorKind::PostponeAtRoot)
    );
}

#[test]
fn deferral_after_suspension_still_resumes_at_the_recorded_slot() {
    // The content first suspends on an awaitable, and the continuation
    // task then postpones: the recorded address must survive the task
    // handoff.
    let awaitable = Awaitable::new();
    let ready = Rc::new(Cell::new(false));
    let tree = |aw: &Awaitable| {
        Node::element(
            "main",
            &[],
            vec![Node::suspense(
                vec![Node::text("loading")],
                vec![Node::async_node(aw.clone())],
            )],
        )
    };

    let first = BufferSink::new();
    let mut pre = prerender(tree(&awaitable), RenderOptions::new(), RenderCallbacks::new());
    pre.start_flowing(Box::new(first.clone()));
    assert!(!pre.is_complete());

    // The pending value arrives, but its component decides to defer.
    awaitable.resolve(deferrable(&ready, "slow part"));
    pre.perform_work();
    assert!(pre.is_complete());
    let token = pre.into_resume_token().expect("deferred");

    ready.set(true);
    let resolved = Awaitable::new();
    resolved.resolve(deferrable(&ready, "slow part"));
    let second = BufferSink::new();
    let mut res = resume(
        tree(&resolved),
        token,
        RenderOptions::new(),
        RenderCallbacks::new(),
    );
    res.start_flowing(Box::new(second.clone()));

    let patch = second.contents_utf8();
    assert!(patch.contains("slow part"));
    assert!(patch.contains("$RC(\"B:0\",\"S:0\")"));
    assert!(res.is_complete());
}
