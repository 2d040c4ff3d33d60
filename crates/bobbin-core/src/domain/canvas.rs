//! Canvas - workflow composition (chain / group / chord).
//!
//! A workflow is encoded entirely in continuations:
//! - a chain is a signature whose `link` holds the rest of the chain
//! - a group is a set of signatures sharing one `group_id`
//! - a chord is a group plus a body stored in the group's barrier record
//!
//! A group followed by another step inside a chain becomes a chord whose
//! body is the rest of the chain, so the next step receives the ordered
//! list of the group's results.

use serde::{Deserialize, Serialize};

use super::ids::GroupId;
use super::signature::Signature;
use crate::ports::IdGenerator;

/// What to do with a chord's callback when a header member fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChordErrorPolicy {
    /// The callback never runs; its result records a `ChordError`.
    #[default]
    FailFast,
    /// The callback runs; failed slots hold an error marker.
    Partial,
}

/// Anything that can be submitted or used as a continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Canvas {
    Task(Signature),
    Group(Group),
    Chord(Chord),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub tasks: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    pub header: Group,
    pub body: Box<Canvas>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ChordErrorPolicy>,
}

impl Canvas {
    /// Sequential composition: `next` runs with this canvas's result.
    ///
    /// For a signature that already has continuations, `next` is attached
    /// after the most recently linked one (the tail of an existing chain).
    pub fn then(self, next: impl Into<Canvas>) -> Canvas {
        let next = next.into();
        match self {
            Canvas::Task(mut sig) => {
                match sig.options.link.pop() {
                    Some(tail) => sig.options.link.push(tail.then(next)),
                    None => sig.options.link.push(next),
                }
                Canvas::Task(sig)
            }
            Canvas::Group(header) => Canvas::Chord(Chord {
                header,
                body: Box::new(next),
                policy: None,
            }),
            Canvas::Chord(mut chord) => {
                let body = *chord.body;
                chord.body = Box::new(body.then(next));
                Canvas::Chord(chord)
            }
        }
    }

    /// Assign task ids and group ids wherever they are missing.
    pub fn freeze(self, ids: &dyn IdGenerator) -> Canvas {
        match self {
            Canvas::Task(sig) => Canvas::Task(sig.freeze(ids)),
            Canvas::Group(group) => Canvas::Group(group.freeze(ids)),
            Canvas::Chord(chord) => Canvas::Chord(chord.freeze(ids)),
        }
    }

    pub fn as_signature(&self) -> Option<&Signature> {
        match self {
            Canvas::Task(sig) => Some(sig),
            _ => None,
        }
    }
}

impl Group {
    pub fn new<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Signature>,
    {
        Self {
            group_id: None,
            tasks: tasks.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn freeze(mut self, ids: &dyn IdGenerator) -> Self {
        if self.group_id.is_none() {
            self.group_id = Some(ids.generate_group_id());
        }
        self.tasks = self.tasks.into_iter().map(|s| s.freeze(ids)).collect();
        self
    }
}

impl Chord {
    pub fn new(header: Group, body: impl Into<Canvas>) -> Self {
        Self {
            header,
            body: Box::new(body.into()),
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: ChordErrorPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn freeze(self, ids: &dyn IdGenerator) -> Self {
        Self {
            header: self.header.freeze(ids),
            body: Box::new(self.body.freeze(ids)),
            policy: self.policy,
        }
    }
}

impl From<Signature> for Canvas {
    fn from(sig: Signature) -> Self {
        Canvas::Task(sig)
    }
}

impl From<Group> for Canvas {
    fn from(group: Group) -> Self {
        Canvas::Group(group)
    }
}

impl From<Chord> for Canvas {
    fn from(chord: Chord) -> Self {
        Canvas::Chord(chord)
    }
}

/// `steps[0] | steps[1] | ...`. `None` for an empty iterator.
pub fn chain<I>(steps: I) -> Option<Canvas>
where
    I: IntoIterator<Item = Canvas>,
{
    let steps: Vec<Canvas> = steps.into_iter().collect();
    steps
        .into_iter()
        .rev()
        .reduce(|next, step| step.then(next))
}

pub fn group<I>(tasks: I) -> Group
where
    I: IntoIterator<Item = Signature>,
{
    Group::new(tasks)
}

pub fn chord<I>(header: I, body: impl Into<Canvas>) -> Chord
where
    I: IntoIterator<Item = Signature>,
{
    Chord::new(Group::new(header), body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{SystemClock, UlidGenerator};

    fn sig(name: &str) -> Signature {
        Signature::new(name)
    }

    #[test]
    fn chain_nests_links() {
        let c = chain([sig("a").into(), sig("b").into(), sig("c").into()]).unwrap();

        let a = c.as_signature().unwrap();
        assert_eq!(a.task, "a");
        assert_eq!(a.options.link.len(), 1);

        let b = a.options.link[0].as_signature().unwrap();
        assert_eq!(b.task, "b");
        let c = b.options.link[0].as_signature().unwrap();
        assert_eq!(c.task, "c");
        assert!(c.options.link.is_empty());
    }

    #[test]
    fn empty_chain_is_none() {
        assert!(chain(Vec::<Canvas>::new()).is_none());
    }

    #[test]
    fn group_followed_by_step_becomes_chord() {
        let c = chain([
            sig("fetch").into(),
            group([sig("p1"), sig("p2")]).into(),
            sig("aggregate").into(),
        ])
        .unwrap();

        let fetch = c.as_signature().unwrap();
        match &fetch.options.link[0] {
            Canvas::Chord(chord) => {
                assert_eq!(chord.header.len(), 2);
                assert_eq!(chord.body.as_signature().unwrap().task, "aggregate");
            }
            other => panic!("expected chord, got {other:?}"),
        }
    }

    #[test]
    fn then_on_chord_extends_body() {
        let c = Canvas::from(chord([sig("h")], sig("body"))).then(sig("after"));
        let Canvas::Chord(chord) = c else {
            panic!("expected chord");
        };
        let body = chord.body.as_signature().unwrap();
        assert_eq!(body.options.link[0].as_signature().unwrap().task, "after");
    }

    #[test]
    fn freeze_assigns_every_id_once() {
        let ids = UlidGenerator::new(SystemClock);
        let c = Canvas::from(chord([sig("h1"), sig("h2")], sig("cb"))).freeze(&ids);
        let Canvas::Chord(chord) = &c else {
            panic!("expected chord");
        };
        assert!(chord.header.group_id.is_some());
        assert!(chord.header.tasks.iter().all(|s| s.id().is_some()));
        assert!(chord.body.as_signature().unwrap().id().is_some());

        // freezing again keeps the ids
        let again = c.clone().freeze(&ids);
        assert_eq!(again, c);
    }

    #[test]
    fn canvas_serializes_with_kind_tag() {
        let v = serde_json::to_value(Canvas::from(sig("a"))).unwrap();
        assert_eq!(v["kind"], "task");
        assert_eq!(v["task"], "a");

        let back: Canvas = serde_json::from_value(v).unwrap();
        assert_eq!(back, Canvas::from(sig("a")));
    }
}
