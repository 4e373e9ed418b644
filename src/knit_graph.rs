//! Arena-backed knit graph: loops, yarns and the stitch edges pulling
//! child loops through their parents.

use std::collections::HashSet;
use std::fmt;

use crate::error::KnitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YarnId(pub usize);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Which way a child loop is pulled through its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullDirection {
    /// Back to front: a knit stitch.
    BtF,
    /// Front to back: a purl stitch.
    FtB,
}

impl PullDirection {
    pub fn opposite(self) -> PullDirection {
        match self {
            PullDirection::BtF => PullDirection::FtB,
            PullDirection::FtB => PullDirection::BtF,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub id: LoopId,
    pub yarn: YarnId,
    /// Parents bottom to top.
    pub parents: Vec<LoopId>,
    creating_instruction: Option<String>,
    /// Instructions that touched the loop after it was made.
    pub instructions: Vec<String>,
}

impl Loop {
    pub fn creating_instruction(&self) -> Option<&str> {
        self.creating_instruction.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Yarn {
    pub id: YarnId,
    pub carrier: u32,
    pub size: Option<u32>,
    pub plies: Option<u32>,
    pub color: Option<String>,
    /// Loops in the order the yarn produced them.
    pub loops: Vec<LoopId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StitchEdge {
    pub parent: LoopId,
    pub child: LoopId,
    pub pull_direction: PullDirection,
    /// Crossing depth for cables; 0 when uncrossed.
    pub depth: i32,
    pub parent_offset: i32,
}

#[derive(Debug, Clone, Default)]
pub struct KnitGraph {
    loops: Vec<Loop>,
    yarns: Vec<Yarn>,
    edges: Vec<StitchEdge>,
}

impl KnitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_yarn(&mut self, carrier: u32) -> YarnId {
        let id = YarnId(self.yarns.len());
        self.yarns.push(Yarn {
            id,
            carrier,
            size: None,
            plies: None,
            color: None,
            loops: Vec::new(),
        });
        id
    }

    pub fn yarn(&self, id: YarnId) -> Option<&Yarn> {
        self.yarns.get(id.0)
    }

    pub fn yarn_mut(&mut self, id: YarnId) -> Option<&mut Yarn> {
        self.yarns.get_mut(id.0)
    }

    pub fn yarns(&self) -> &[Yarn] {
        &self.yarns
    }

    pub fn yarn_has_loops(&self, id: YarnId) -> bool {
        self.yarn(id).is_some_and(|y| !y.loops.is_empty())
    }

    /// Append a new loop to the end of a yarn.
    pub fn add_loop(&mut self, yarn: YarnId) -> Result<LoopId, KnitError> {
        let id = LoopId(self.loops.len());
        let y = self
            .yarns
            .get_mut(yarn.0)
            .ok_or_else(|| KnitError::knitting(format!("unknown yarn {}", yarn.0)))?;
        y.loops.push(id);
        self.loops.push(Loop {
            id,
            yarn,
            parents: Vec::new(),
            creating_instruction: None,
            instructions: Vec::new(),
        });
        Ok(id)
    }

    pub fn get(&self, id: LoopId) -> Option<&Loop> {
        self.loops.get(id.0)
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn edges(&self) -> &[StitchEdge] {
        &self.edges
    }

    pub fn contains(&self, id: LoopId) -> bool {
        id.0 < self.loops.len()
    }

    /// Set the instruction that created a loop. Later calls are ignored.
    pub fn set_creating_instruction(&mut self, id: LoopId, instruction: &str) {
        if let Some(l) = self.loops.get_mut(id.0) {
            if l.creating_instruction.is_none() {
                l.creating_instruction = Some(instruction.to_string());
            } else {
                l.instructions.push(instruction.to_string());
            }
        }
    }

    pub fn touch(&mut self, id: LoopId, instruction: &str) {
        if let Some(l) = self.loops.get_mut(id.0) {
            l.instructions.push(instruction.to_string());
        }
    }

    /// Attach `child` to `parent`. `stack_position` indexes the child's parent
    /// stack (bottom is 0); `None` places the parent on top.
    pub fn connect_loops(
        &mut self,
        parent: LoopId,
        child: LoopId,
        pull_direction: PullDirection,
        stack_position: Option<usize>,
        depth: i32,
        parent_offset: i32,
    ) -> Result<(), KnitError> {
        if !self.contains(parent) {
            return Err(KnitError::knitting(format!("parent loop {parent} is not in this graph")));
        }
        let child_loop = self
            .loops
            .get_mut(child.0)
            .ok_or_else(|| KnitError::knitting(format!("child loop {child} is not in this graph")))?;
        match stack_position {
            Some(i) if i <= child_loop.parents.len() => child_loop.parents.insert(i, parent),
            _ => child_loop.parents.push(parent),
        }
        self.edges.push(StitchEdge {
            parent,
            child,
            pull_direction,
            depth,
            parent_offset,
        });
        Ok(())
    }

    pub fn stitch_edge(&self, parent: LoopId, child: LoopId) -> Option<&StitchEdge> {
        self.edges
            .iter()
            .find(|e| e.parent == parent && e.child == child)
    }

    pub fn children_of(&self, parent: LoopId) -> Vec<LoopId> {
        self.edges
            .iter()
            .filter(|e| e.parent == parent)
            .map(|e| e.child)
            .collect()
    }

    /// Split loops into courses: walking loops in creation order, a new course
    /// starts whenever a loop has a parent in the current course.
    pub fn courses(&self) -> Vec<Vec<LoopId>> {
        let mut courses = Vec::new();
        let mut current: Vec<LoopId> = Vec::new();
        let mut current_set: HashSet<LoopId> = HashSet::new();
        for l in &self.loops {
            let parent_in_course = l.parents.iter().any(|p| current_set.contains(p));
            if parent_in_course {
                courses.push(std::mem::take(&mut current));
                current_set.clear();
            }
            current.push(l.id);
            current_set.insert(l.id);
        }
        if !current.is_empty() {
            courses.push(current);
        }
        courses
    }
}
