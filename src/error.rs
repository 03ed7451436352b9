//! Error types for the assembler, linker and BTF merger
//!
//! Every failure surfaces as one of these variants with a stable message
//! prefix; the regression tests match on those prefixes.

use thiserror::Error;

/// Toolchain errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Operand and immediate lexing
    /// Unknown mnemonic on a program-section line
    #[error("Unrecognised instruction {0}")]
    UnrecognisedInstruction(String),

    /// Direct operand is not a register, immediate or label
    #[error("Bad direct operand {0}")]
    BadDirectOperand(String),

    /// Bracketed operand is malformed
    #[error("Bad indirect operand {0}")]
    BadIndirectOperand(String),

    /// Size suffix on a bare register inside brackets, e.g. `[r0.l]`
    #[error("Bad size in indirect operand {0}")]
    BadSizeInIndirectOperand(String),

    /// Size suffix on the base register of a displaced operand, e.g. `[r0.l+4]`
    #[error("Bad size in offset operand {0}")]
    BadSizeInOffsetOperand(String),

    /// Token is not an octal, decimal or hex literal, nor a known equate
    #[error("Bad immediate {0}")]
    BadImmediate(String),

    /// Register outside r0..r10
    #[error("Bad register {0}")]
    BadRegister(String),

    /// Numeric jump offset without an explicit sign
    #[error("Bad jump offset (missing + sign?), got {0}")]
    BadJumpOffsetSign(String),

    /// Jump offset that is neither a signed immediate nor a label
    #[error("Bad jump offset, expected label or +/-imm, got {0}")]
    BadJumpOffset(String),

    /// Unknown jump condition code
    #[error("Bad jump op {0}")]
    BadJumpOp(String),

    /// Size suffix on a compare destination (compares are always quadword)
    #[error("Bad size in jump dst {0}")]
    BadSizeInJumpDst(String),

    /// Size suffix on a compare source (compares are always quadword)
    #[error("Bad size in jump src {0}")]
    BadSizeInJumpSrc(String),

    // Arity and shape
    /// Wrong argument count for a mnemonic or directive
    #[error("Bad {op}, expected {expected}, got {got}")]
    Arity {
        /// Mnemonic or directive name
        op: String,
        /// Expected argument description, e.g. "2 args"
        expected: &'static str,
        /// The arguments actually given
        got: String,
    },

    /// Operand shape has no encoding, e.g. `ld mem,mem`
    #[error("{what} illegal: {line}")]
    IllegalShape {
        /// The rejected shape, e.g. "ld imm,..."
        what: String,
        /// Offending source line
        line: String,
    },

    /// Bracketless operand where a memory operand was meant
    #[error("{what} illegal (missing []?): {line}")]
    MissingBrackets {
        /// The rejected shape, e.g. "ld reg+disp,..."
        what: String,
        /// Offending source line
        line: String,
    },

    /// Both operands carry a size suffix and they disagree
    #[error("Mismatched sizes: {0}")]
    MismatchedSizes(String),

    /// Size suffix not valid for this operation
    #[error("Bad size {size} for {what}: {line}")]
    BadSizeFor {
        /// The size suffix letter
        size: char,
        /// What rejected it, e.g. "register load", "ALU op"
        what: &'static str,
        /// Offending source line
        line: String,
    },

    /// `ldpkt` destination is a register other than r0
    #[error("ldpkt dst must be r0, not r{0}")]
    LdpktDst(u8),

    /// `ldpkt` destination is not a register at all
    #[error("Bad ldpkt, dst must be reg, not {0}")]
    LdpktDstNotReg(String),

    /// `ldpkt` source is not a bracketed operand
    #[error("Bad ldpkt, src must be indirect, not {0}")]
    LdpktSrcNotIndirect(String),

    /// `end` direction is neither `le` nor `be`
    #[error("Bad end, expected le or be, got {0}")]
    BadEndDirection(String),

    /// `call` argument is neither a helper number nor a label/offset
    #[error("Bad call, expected function identifier, label or offset, but got {0}")]
    BadCall(String),

    // Ranges
    /// Field value does not fit its encoding
    #[error("Value out of range for {kind}: {value}")]
    ValueOutOfRange {
        /// Field width, "s16", "s32" or "u64"
        kind: &'static str,
        /// The rejected value
        value: i128,
    },

    // Sections and directives
    /// Unknown `.directive`
    #[error("No such directive .{0}")]
    NoSuchDirective(String),

    /// Instruction or data line outside any section
    #[error("Not in a section at {0}")]
    NotInSection(String),

    /// `.section` with a plain name before `.text`/`.data` selected a kind
    #[error("Must specify .text or .data before .section")]
    NoSectionKind,

    /// Section name reused with a different assembler kind
    #[error("Section {name} redefined as different type {new}, previously {old}")]
    SectionRedefined {
        /// Section name
        name: String,
        /// Kind of the new definition
        new: &'static str,
        /// Kind of the earlier definition
        old: &'static str,
    },

    /// `.equ` name is empty or starts with a digit
    #[error("Bad .equ name {0}")]
    BadEquName(String),

    /// `.include` file could not be read
    #[error("Failed to include {path}: {reason}")]
    IncludeFailed {
        /// The path given to `.include`
        path: String,
        /// Underlying I/O failure
        reason: String,
    },

    // Symbols
    /// Reference to a label never defined in its section
    #[error("Undefined symbol {0}")]
    UndefinedSymbol(String),

    /// Label defined twice in one section
    #[error("Duplicate label {0}")]
    DuplicateLabel(String),

    // Data section
    /// Unknown data pseudo-op
    #[error("No such .data insn {0}")]
    NoSuchDataInsn(String),

    /// `asciz` argument is not a quoted string
    #[error("asciz takes a string, not {0}")]
    AscizNotString(String),

    // Maps section
    /// Map name defined twice
    #[error("Duplicate map {0}")]
    DuplicateMap(String),

    /// Map definition with the wrong argument count
    #[error("Bad map defn, expected 4 or 5 args, got {0}")]
    BadMapDefn(String),

    /// Flag letter outside the known set
    #[error("Bad map flag {0}")]
    BadMapFlag(char),

    // BTF section
    /// Named type defined twice (forward declarations excepted)
    #[error("Duplicate type {0}")]
    DuplicateType(String),

    /// Unknown or malformed BTF type expression
    #[error("Bad type {0}")]
    BadType(String),

    /// Unknown `int` encoding flag
    #[error("Bad int encoding {0}")]
    BadIntEncoding(String),

    /// Named type reference followed by arguments
    #[error("Named type {0} takes no arguments")]
    NamedTypeArgs(String),

    /// Malformed struct, union or enum member
    #[error("Bad member {0}")]
    BadMember(String),

    /// Size taken of a forward declaration
    #[error("Tried to take size of a fwd declaration")]
    ForwardSize,

    /// Size taken of the void sentinel
    #[error("Tried to take size of void")]
    VoidSize,

    /// Parenthesized type expression does not balance
    #[error("Unbalanced parentheses in {0}")]
    UnbalancedParens(String),

    // ELF reader
    /// Input object is not ELFCLASS64
    #[error("Only 64-bit ELF files supported!")]
    Elf64Only,

    /// Input object is not little-endian
    #[error("Only little-endian ELF files supported!")]
    ElfLittleEndianOnly,

    /// Section or header extends past the end of the file
    #[error("Truncated ELF object")]
    TruncatedElf,

    /// `e_shstrndx` does not name a string table
    #[error("Section name table is not a strtab")]
    ShstrtabNotStrtab,

    // Linker
    /// Input object has the wrong machine type
    #[error("machine_type must be Linux BPF (0xf7)")]
    BadMachineType,

    /// Same-named progbits inputs disagree on section flags
    #[error("Mixed flags for progbits {0}")]
    MixedProgbitsFlags(String),

    /// Relocation against a symbol no input defines
    #[error("Unresolved reloc {sym} in {section}")]
    UnresolvedReloc {
        /// Symbol the relocation names
        sym: String,
        /// Progbits section it applies to
        section: String,
    },

    /// Relocation site does not hold a call instruction
    #[error("Relocation applies to non-CALL instruction")]
    RelocNonCall,

    /// Relocation site call is not a pseudo-call
    #[error("Relocation applies to non-BPF_PSEUDO_CALL")]
    RelocNonPseudoCall,

    /// Internal consistency violation; never a user error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal-consistency error with a message
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create an arity error for a mnemonic or directive
    pub fn arity(op: impl Into<String>, expected: &'static str, got: &[String]) -> Self {
        Error::Arity {
            op: op.into(),
            expected,
            got: format!("{:?}", got),
        }
    }

    /// Create an illegal-shape error carrying the offending line
    pub fn illegal(what: impl Into<String>, line: impl Into<String>) -> Self {
        Error::IllegalShape {
            what: what.into(),
            line: line.into(),
        }
    }
}

/// Result type for toolchain operations
pub type Result<T> = std::result::Result<T, Error>;
