//! The compiler context and pipeline driver.
//!
//! A [`Compiler`] is built once from a [`CompilerConfig`] and owns the code
//! manager. Methods compile independently up to code allocation, so
//! [`Compiler::compile_all`] runs them on scoped worker threads.

use crate::asm::{Assembly, DisassemblyError, Disassembler, InlineDataDecoder};
use crate::code::{CodeCacheError, CodeManager};
use crate::codegen::{CodegenError, TargetMethod, Translator};
use crate::config::{CompilerConfig, ConfigError};
use crate::gc::{MarkingStack, MarkingStackError};
use crate::ir::{BytecodeError, BytecodeMethod, MethodProvider, Program, build, lower, optimize};
use crate::regalloc::allocate;
use crate::target::Target;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;
use tracing::{debug, debug_span, info, trace};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
    #[error(transparent)]
    Disassembly(#[from] DisassemblyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MarkingStack(#[from] MarkingStackError),
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("malformed input: {0}")]
    Input(String),
    #[error("compiler worker panicked")]
    WorkerPanicked,
}

impl CompileError {
    /// Whether the error indicates a compiler bug or exhausted resources
    /// rather than bad input.
    pub fn is_fatal(&self) -> bool {
        match self {
            CompileError::Bytecode(_)
            | CompileError::Disassembly(_)
            | CompileError::Config(_)
            | CompileError::Io { .. }
            | CompileError::Input(_) => false,
            CompileError::Codegen(CodegenError::Unsupported { .. }) => false,
            CompileError::Codegen(_)
            | CompileError::CodeCache(_)
            | CompileError::MarkingStack(_)
            | CompileError::WorkerPanicked => true,
        }
    }
}

#[derive(Debug)]
pub struct Compiler {
    config: CompilerConfig,
    target: Target,
    code_manager: CodeManager,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Result<Self, CompileError> {
        config.validate()?;
        let code_manager = CodeManager::new(&config.code_cache)?;
        Ok(Self { config, target: Target::aarch64(), code_manager })
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn code_manager(&self) -> &CodeManager {
        &self.code_manager
    }

    /// Compile and install one method. Callees found in `provider` may be
    /// inlined.
    pub fn compile(
        &self,
        method: &BytecodeMethod,
        provider: &dyn MethodProvider,
    ) -> Result<Arc<TargetMethod>, CompileError> {
        let span = debug_span!("compile", method = %method.key);
        let _enter = span.enter();

        let mut graph = build(method)?;
        debug!(blocks = graph.blocks.len(), nodes = graph.size(), "built CIR");
        trace!("{}", graph.dump());

        let stats = optimize(&mut graph, &self.config.compiler.optimizer_options(), provider);
        debug!(?stats, nodes = graph.size(), "optimized CIR");
        let eir = lower(&graph);
        debug!(blocks = eir.blocks.len(), vars = eir.vars.len(), literals = eir.literals.len(), "lowered to EIR");
        trace!("{}", eir.dump());

        let allocation = allocate(&eir, &self.target.registers);
        let translator = Translator::new(&self.target, &self.code_manager, self.config.compiler.building_boot_image);
        translator.translate(&eir, &allocation).map_err(|e| match e {
            CodegenError::CodeCache(e) => CompileError::CodeCache(e),
            other => CompileError::Codegen(other),
        })
    }

    fn workers(&self, methods: usize) -> usize {
        let configured = match self.config.compiler.workers {
            0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        configured.clamp(1, methods.max(1))
    }

    /// Compile every method of `program` in parallel. Results are in program
    /// order; the first failure in that order is returned. In boot-image
    /// mode calls are linked once all methods are installed.
    pub fn compile_all(&self, program: &Program) -> Result<Vec<Arc<TargetMethod>>, CompileError> {
        let methods = &program.methods;
        let workers = self.workers(methods.len());
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<Arc<TargetMethod>, CompileError>>>> =
            Mutex::new((0..methods.len()).map(|_| None).collect());

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        loop {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            let Some(method) = methods.get(index) else { break };
                            let result = self.compile(method, program);
                            if let Ok(mut slots) = results.lock() {
                                slots[index] = Some(result);
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect::<Result<Vec<()>, _>>()
        })
        .map_err(|_| CompileError::WorkerPanicked)?;

        let results = results.into_inner().map_err(|_| CompileError::WorkerPanicked)?;
        let compiled = results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(CompileError::WorkerPanicked)))
            .collect::<Result<Vec<_>, _>>()?;

        if self.config.compiler.building_boot_image {
            let patched = self.code_manager.link_all()?;
            info!(methods = compiled.len(), patched, "boot image compiled");
        }
        Ok(compiled)
    }

    /// Disassembly of an installed method, using the configured
    /// disassembler options.
    pub fn disassemble(&self, method: &TargetMethod) -> Result<String, CompileError> {
        let options = &self.config.disassembler;
        let decoder = InlineDataDecoder::decode(method.inline_data())?;
        let text = Disassembler::new(Assembly::aarch64(), method.code_start())
            .with_preference(options.preference)
            .inline_invalid_as_bytes(options.inline_invalid_as_bytes)
            .with_inline_data(decoder)
            .render(method.code())?;
        Ok(text)
    }

    /// A marking stack sized by the configuration.
    pub fn marking_stack(&self) -> Result<MarkingStack, CompileError> {
        Ok(MarkingStack::from_config(&self.config.marking_stack)?)
    }
}
