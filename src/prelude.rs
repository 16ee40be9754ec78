//! Prelude - the core sites every run can call
//!
//! - `Let`: publish its argument, or a tuple of its arguments
//! - `Ift` / `Iff`: publish a signal if the boolean is true / false, else halt
//! - `Add`, `Sub`, `Eq`, `Less`: integer arithmetic and comparison
//! - `Error`: raise its argument
//! - `Rwait`: publish a signal after the given number of milliseconds
//!
//! Everything but `Rwait` answers synchronously.

use std::time::Duration;

use crate::errors::SiteError;
use crate::site::{Capability, FnSite, ReturnHandle, Site, SiteOutcome, SiteTable};
use crate::value::Value;

/// A site table holding the prelude
pub fn site_table() -> SiteTable {
    let mut table = SiteTable::new();
    register(&mut table);
    table
}

/// Add the prelude to an existing table
pub fn register(table: &mut SiteTable) {
    table.register(FnSite::new("Let", |args| {
        SiteOutcome::Resume(match args {
            [] => Value::Signal,
            [one] => one.clone(),
            many => Value::tuple(many.iter().cloned()),
        })
    }));
    table.register(FnSite::new("Ift", |args| guard("Ift", args, true)));
    table.register(FnSite::new("Iff", |args| guard("Iff", args, false)));
    table.register(FnSite::new("Add", |args| {
        int_pair("Add", args).and_then(|(a, b)| checked(a.checked_add(b), "Add")).into()
    }));
    table.register(FnSite::new("Sub", |args| {
        int_pair("Sub", args).and_then(|(a, b)| checked(a.checked_sub(b), "Sub")).into()
    }));
    table.register(FnSite::new("Less", |args| {
        int_pair("Less", args).map(|(a, b)| Value::Bool(a < b)).into()
    }));
    table.register(FnSite::new("Eq", |args| match args {
        [a, b] => SiteOutcome::Resume(Value::Bool(a == b)),
        _ => arity("Eq", 2, args.len()),
    }));
    table.register(FnSite::new("Error", |args| match args {
        [error] => SiteOutcome::Raise(error.clone()),
        _ => arity("Error", 1, args.len()),
    }));
    table.register(Rwait);
}

/// Publishes a signal after the given number of milliseconds. The wait is
/// handed to the engine's timer, so concurrent waits overlap and a
/// cancelled wait is dropped early.
struct Rwait;

impl Site for Rwait {
    fn name(&self) -> &str {
        "Rwait"
    }

    fn capability(&self) -> Capability {
        Capability::Time
    }

    fn invoke(&self, args: &[Value], ret: ReturnHandle) {
        match args {
            [Value::Int(ms)] if *ms >= 0 => ret.answer_after(
                Duration::from_millis(*ms as u64),
                SiteOutcome::Resume(Value::Signal),
            ),
            [Value::Int(_)] => ret.halt(),
            [other] => ret.raise(
                SiteError::TypeMismatch {
                    site: "Rwait".into(),
                    expected: "Int",
                    got: other.type_name(),
                }
                .to_value(),
            ),
            _ => ret.answer(arity("Rwait", 1, args.len())),
        }
    }
}

fn guard(site: &str, args: &[Value], when: bool) -> SiteOutcome {
    match args {
        [Value::Bool(b)] if *b == when => SiteOutcome::Resume(Value::Signal),
        [Value::Bool(_)] => SiteOutcome::Halt,
        [other] => SiteOutcome::Raise(
            SiteError::TypeMismatch {
                site: site.into(),
                expected: "Bool",
                got: other.type_name(),
            }
            .to_value(),
        ),
        _ => arity(site, 1, args.len()),
    }
}

fn int_pair(site: &str, args: &[Value]) -> Result<(i64, i64), SiteError> {
    match args {
        [Value::Int(a), Value::Int(b)] => Ok((*a, *b)),
        [a, b] => {
            let got = if a.as_int().is_none() { a } else { b };
            Err(SiteError::TypeMismatch {
                site: site.into(),
                expected: "Int",
                got: got.type_name(),
            })
        }
        _ => Err(SiteError::ArityMismatch {
            callee: site.into(),
            expected: 2,
            got: args.len(),
        }),
    }
}

fn checked(result: Option<i64>, site: &str) -> Result<Value, SiteError> {
    result
        .map(Value::Int)
        .ok_or_else(|| SiteError::Custom(format!("{site}: integer overflow")))
}

fn arity(site: &str, expected: usize, got: usize) -> SiteOutcome {
    SiteOutcome::Raise(
        SiteError::ArityMismatch {
            callee: site.into(),
            expected,
            got,
        }
        .to_value(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::eval::{Engine, RunOutcome};
    use crate::graph::{Arg, GraphBuilder};
    use crate::sink::BufferSink;

    fn call(site: &str, args: Vec<Arg>) -> (Vec<Value>, Vec<Value>) {
        let sink = BufferSink::new();
        let mut engine = Engine::new(EngineConfig::default(), site_table(), sink.clone());
        let mut b = GraphBuilder::new();
        let publish = b.publish();
        let root = b.call(Arg::site(site), args, publish);
        engine.start(b.finish(root)).unwrap();
        assert_eq!(engine.run(), Ok(RunOutcome::Completed));
        (sink.published(), sink.uncaught())
    }

    #[test]
    fn arithmetic() {
        assert_eq!(call("Add", vec![Arg::lit(2), Arg::lit(3)]).0, vec![Value::Int(5)]);
        assert_eq!(call("Sub", vec![Arg::lit(2), Arg::lit(3)]).0, vec![Value::Int(-1)]);
        assert_eq!(call("Less", vec![Arg::lit(2), Arg::lit(3)]).0, vec![Value::Bool(true)]);
        assert_eq!(call("Eq", vec![Arg::lit("a"), Arg::lit("a")]).0, vec![Value::Bool(true)]);
    }

    #[test]
    fn let_tuples_many_arguments() {
        assert_eq!(
            call("Let", vec![Arg::lit(1), Arg::lit(true)]).0,
            vec![Value::tuple([Value::Int(1), Value::Bool(true)])]
        );
    }

    #[test]
    fn guards_halt_when_false() {
        assert_eq!(call("Ift", vec![Arg::lit(true)]).0, vec![Value::Signal]);
        let (published, uncaught) = call("Ift", vec![Arg::lit(false)]);
        assert!(published.is_empty());
        assert!(uncaught.is_empty());
        assert_eq!(call("Iff", vec![Arg::lit(false)]).0, vec![Value::Signal]);
    }

    #[test]
    fn type_errors_are_raised() {
        let (published, uncaught) = call("Add", vec![Arg::lit(1), Arg::lit("x")]);
        assert!(published.is_empty());
        assert_eq!(
            uncaught,
            vec![Value::tagged("TypeMismatch", [Value::str("Add: expected Int, got String")])]
        );
    }

    #[test]
    fn error_raises_its_argument() {
        let (_, uncaught) = call("Error", vec![Arg::lit("boom")]);
        assert_eq!(uncaught, vec![Value::str("boom")]);
    }

    #[test]
    fn rwait_resumes_from_the_timer() {
        assert_eq!(call("Rwait", vec![Arg::lit(5)]).0, vec![Value::Signal]);
    }

    #[test]
    fn rwait_with_negative_delay_halts() {
        let (published, uncaught) = call("Rwait", vec![Arg::lit(-1)]);
        assert!(published.is_empty());
        assert!(uncaught.is_empty());
    }
}
