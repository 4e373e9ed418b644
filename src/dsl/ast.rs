//! Statement tree produced by the KnitScript parser.

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A parsed pattern or module.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

/// Left-hand side of `=`.
#[derive(Debug, Clone)]
pub enum AssignTarget {
    Name(String),
    Index { object: Expr, index: Expr },
}

/// `def f(a, b=1)`
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// One `Type [as name]` entry of a catch clause.
#[derive(Debug, Clone)]
pub struct CatchType {
    pub family: String,
    pub binding: Option<String>,
}

/// `knit f1, f2;` inside a carriage-pass block.
#[derive(Debug, Clone)]
pub struct InstructionAssignment {
    pub instruction: Expr,
    pub needles: Vec<Expr>,
    pub span: Span,
}

/// How an xfer pass pairs needles with the opposite bed.
#[derive(Debug, Clone)]
pub enum XferRack {
    Across,
    /// `N to Left` / `N to Right`
    Offset { distance: Expr, side: Expr },
}

#[derive(Debug, Clone)]
pub enum PushTarget {
    Front,
    Back,
    Layer(Expr),
    /// `push n 2 forward;` (no amount means one step)
    Forward(Option<Expr>),
    Backward(Option<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    Layer,
    Sheet,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Assign { target: AssignTarget, value: Expr },
    Global { name: String, value: Expr },
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    While { condition: Expr, body: Vec<Stmt> },
    For {
        variables: Vec<String>,
        iterables: Vec<Expr>,
        body: Vec<Stmt>,
    },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Stmt>,
    },
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchType>,
        handler: Vec<Stmt>,
    },
    Assert { condition: Expr, message: Option<Expr> },
    Print(Expr),
    Pause,
    Return(Option<Expr>),
    FunctionDef {
        name: String,
        params: Vec<Param>,
        body: std::rc::Rc<[Stmt]>,
    },
    Import { path: Vec<String>, alias: Option<String> },
    CarriagePass {
        direction: Expr,
        instructions: Vec<InstructionAssignment>,
    },
    Xfer {
        needles: Vec<Expr>,
        rack: XferRack,
        bed: Option<Expr>,
        sliders: bool,
    },
    Drop(Vec<Expr>),
    Cut(Vec<Expr>),
    Remove(Vec<Expr>),
    Releasehook,
    Push { needles: Vec<Expr>, target: PushTarget },
    Swap {
        needles: Vec<Expr>,
        kind: SwapKind,
        value: Expr,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

/// Piece of an `f"..."` string.
#[derive(Debug, Clone)]
pub enum FStringPart {
    Text(String),
    Hole(Expr),
}

/// Argument at a call site.
#[derive(Debug, Clone)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
}

/// `for a, b in it if cond` tail of a comprehension.
#[derive(Debug, Clone)]
pub struct Comprehension {
    pub variables: Vec<String>,
    pub iterable: Box<Expr>,
    pub condition: Option<Box<Expr>>,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FString(Vec<FStringPart>),
    /// `f3`, `bs12`
    Needle(String),
    /// `c2`
    Carrier(u32),
    /// `s1`, `s1:g2`
    Sheet { sheet: i32, gauge: Option<i32> },
    /// `Leftward`, `-->`, `opposite`, ...
    Direction(DirectionWord),
    Ident(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    ListComp {
        element: Box<Expr>,
        comp: Comprehension,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        comp: Comprehension,
    },
    Unpack(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call { callee: Box<Expr>, args: Vec<Arg> },
    Attribute { object: Box<Expr>, name: String },
    Index { object: Box<Expr>, index: Box<Expr> },
    Slice {
        object: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// `s of g sheets`
    Gauge { sheet: Box<Expr>, gauge: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionWord {
    Leftward,
    Rightward,
    Current,
    Opposite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Is,
    IsNot,
    In,
    NotIn,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Is => "is",
            BinOp::IsNot => "is not",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}
