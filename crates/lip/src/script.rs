//! Scripts: loading, dumping and executing.
//!
//! [`Context::load_script`] sniffs the first four bytes of the stream: the
//! `LIP\0` magic selects the bytecode loader, anything else is pushed back
//! and compiled as source. A dumped script is the magic, a pointer-size
//! byte, a byte-order mark of 1, then the function image verbatim; the
//! image is position-independent, so the blob round-trips untouched.

use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::image::{FnHeader, FunctionImage, HEADER_SIZE};
use crate::io::{Input, Output, PrefixInput, read_exact};
use crate::loc::NOWHERE;
use crate::runtime::{Context, compile_source};
use crate::value::{Closure, Links, ScriptFn, Value};
use crate::vm::Vm;

/// Magic bytes of a bytecode file.
const BINARY_MAGIC: [u8; 4] = *b"LIP\0";

/// A loaded script: a compiled image plus its link table.
#[derive(Debug)]
pub struct Script {
    image: Arc<FunctionImage>,
    links: Arc<Links>,
    linked: bool,
    filename: String,
}

impl Script {
    /// The script's compiled image.
    #[must_use]
    pub fn image(&self) -> &Arc<FunctionImage> {
        &self.image
    }

    /// The filename the script was loaded from.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Whether imports have been resolved.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub(crate) fn root_closure(&self) -> Value {
        let fun = ScriptFn {
            image: Arc::clone(&self.image),
            offset: 0,
            links: Arc::clone(&self.links),
        };
        Value::Function(Arc::new(Closure::script(fun, Vec::new())))
    }
}

impl Context {
    /// Loads a script from `input`, or from the filesystem when `input` is
    /// `None`. With `link` set, all imports resolve immediately (loading
    /// modules as needed); otherwise linking is deferred to the first
    /// [`Context::exec_script`].
    pub fn load_script(
        &mut self,
        filename: &str,
        input: Option<Box<dyn Input + Send>>,
        link: bool,
    ) -> Result<Script, Error> {
        let result = self.do_load_script(filename, input, link);
        match result {
            Ok(script) => Ok(script),
            Err(err) => Err(self.record_error(err)),
        }
    }

    fn do_load_script(
        &mut self,
        filename: &str,
        input: Option<Box<dyn Input + Send>>,
        link: bool,
    ) -> Result<Script, Error> {
        let fs = Arc::clone(&self.runtime().config().fs);
        let own_input = input.is_none();
        let mut input: Box<dyn Input + Send> = match input {
            Some(input) => input,
            None => fs.begin_read(filename).map_err(|fs_error| {
                Error::with_record(ErrorKind::Io, fs_error, filename, NOWHERE)
            })?,
        };

        let image = load_function(filename, input.as_mut());
        if own_input {
            fs.end_read(input);
        }
        let image = Arc::new(image?);

        let mut script = Script {
            image,
            links: Arc::new(Links::default()),
            linked: false,
            filename: filename.to_owned(),
        };
        if link {
            self.link_script(&mut script)?;
        }
        Ok(script)
    }

    fn link_script(&mut self, script: &mut Script) -> Result<(), Error> {
        self.begin_load();
        let links = self.link_function(&script.image, &script.filename);
        self.end_load(links.is_ok());
        script.links = Arc::new(links?);
        script.linked = true;
        Ok(())
    }

    /// Executes a script on `vm`, linking it first if needed. On a runtime
    /// error the VM is left error-inconsistent; reset it before reuse.
    pub fn exec_script(&mut self, vm: &mut Vm, script: &mut Script) -> Result<Value, Error> {
        if !script.linked {
            if let Err(err) = self.link_script(script) {
                return Err(self.record_error(err));
            }
        }
        let closure = script.root_closure();
        match vm.call(&closure, &[]) {
            Ok(value) => Ok(value),
            Err(error_value) => {
                let err = self.traceback(vm, &error_value);
                Err(self.record_error(err))
            }
        }
    }

    /// Writes a script's bytecode to `output`, or to the filesystem when
    /// `output` is `None`. The dump can be loaded with
    /// [`Context::load_script`].
    pub fn dump_script(
        &mut self,
        script: &Script,
        filename: &str,
        output: Option<Box<dyn Output + Send>>,
    ) -> Result<(), Error> {
        let fs = Arc::clone(&self.runtime().config().fs);
        let own_output = output.is_none();
        let mut output: Box<dyn Output + Send> = match output {
            Some(output) => output,
            None => fs.begin_write(filename).map_err(|fs_error| {
                let err = Error::with_record(ErrorKind::Io, fs_error, filename, NOWHERE);
                self.record_error(err)
            })?,
        };

        let result = dump_function(&script.image, output.as_mut())
            .map_err(|err| self.record_error(err));
        if own_output {
            fs.end_write(output);
        }
        result
    }
}

fn load_function(
    filename: &str,
    input: &mut (dyn Input + Send),
) -> Result<FunctionImage, Error> {
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < magic.len() {
        let n = input.read(&mut magic[read..]);
        if n == 0 {
            break;
        }
        read += n;
    }

    if read == magic.len() && magic == BINARY_MAGIC {
        load_bytecode(filename, input)
    } else {
        let mut source = PrefixInput::new(magic[..read].to_vec(), &mut *input);
        compile_source(&mut source, filename, false)
    }
}

fn load_bytecode(filename: &str, input: &mut dyn Input) -> Result<FunctionImage, Error> {
    let io_error =
        || Error::with_record(ErrorKind::Io, "Unexpected end of stream", filename, NOWHERE);

    let prefix = read_exact(input, 3).ok_or_else(io_error)?;
    let ptr_size = prefix[0];
    let bom = u16::from_le_bytes([prefix[1], prefix[2]]);
    if ptr_size as usize != size_of::<usize>() || bom != 1 {
        return Err(Error::with_record(
            ErrorKind::Format,
            "Incompatible bytecode",
            filename,
            NOWHERE,
        ));
    }

    let header_bytes = read_exact(input, HEADER_SIZE).ok_or_else(io_error)?;
    let header = FnHeader::read(&header_bytes).ok_or_else(|| {
        Error::with_record(ErrorKind::Format, "Malformed bytecode", filename, NOWHERE)
    })?;
    if header.size as usize <= HEADER_SIZE {
        return Err(Error::with_record(
            ErrorKind::Format,
            "Malformed bytecode",
            filename,
            NOWHERE,
        ));
    }

    let body = read_exact(input, header.size as usize - HEADER_SIZE).ok_or_else(io_error)?;
    let mut bytes = header_bytes;
    bytes.extend_from_slice(&body);
    FunctionImage::from_bytes(bytes).map_err(|message| {
        Error::with_record(ErrorKind::Format, message, filename, NOWHERE)
    })
}

fn dump_function(image: &FunctionImage, output: &mut dyn Output) -> Result<(), Error> {
    let mut payload = Vec::with_capacity(7 + image.as_bytes().len());
    payload.extend_from_slice(&BINARY_MAGIC);
    payload.push(u8::try_from(size_of::<usize>()).unwrap_or(8));
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.extend_from_slice(image.as_bytes());

    if output.write(&payload) != payload.len() {
        return Err(Error::new(ErrorKind::Io, "Short write while dumping script"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::io::{SliceInput, VecInput, VecOutput};
    use crate::runtime::{Runtime, RuntimeConfig};

    use super::*;

    fn context() -> Context {
        let mut ctx = Context::new(Runtime::new(RuntimeConfig::default()));
        crate::builtins::load_builtins(&mut ctx);
        ctx
    }

    fn load_source(ctx: &mut Context, src: &str) -> Script {
        ctx.load_script(
            "test.lip",
            Some(Box::new(VecInput::new(src.as_bytes().to_vec()))),
            false,
        )
        .expect("script loads")
    }

    fn dump(script: &Script) -> Vec<u8> {
        let mut collector = VecOutput::new();
        dump_function(script.image(), &mut collector).expect("dump succeeds");
        collector.into_bytes()
    }

    #[test]
    fn source_scripts_execute() {
        let mut ctx = context();
        let mut script = load_source(&mut ctx, "(+ 1 2)");
        let mut vm = ctx.create_vm(None);
        let result = ctx.exec_script(&mut vm, &mut script).expect("runs");
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn bytecode_round_trips() {
        let mut ctx = context();
        let script = load_source(&mut ctx, "(let ((x 12)) (* x 3.5))");
        let dumped = dump(&script);
        assert_eq!(&dumped[..4], b"LIP\0");

        let mut reloaded = ctx
            .load_script(
                "test.lipc",
                Some(Box::new(VecInput::new(dumped.clone()))),
                false,
            )
            .expect("bytecode loads");
        let mut vm = ctx.create_vm(None);
        let result = ctx.exec_script(&mut vm, &mut reloaded).expect("runs");
        assert_eq!(result, Value::Number(42.0));

        // dump(load(dump(x))) == dump(load(x))
        let redumped = dump(&reloaded);
        assert_eq!(dumped, redumped);
    }

    #[test]
    fn incompatible_pointer_size_is_a_format_error() {
        let mut ctx = context();
        let mut bytes = BINARY_MAGIC.to_vec();
        bytes.push(4); // wrong pointer size
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        let err = ctx
            .load_script("bad.lipc", Some(Box::new(VecInput::new(bytes))), false)
            .expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::Format);
        assert_eq!(err.message, "Incompatible bytecode");
    }

    #[test]
    fn truncated_bytecode_is_malformed() {
        let mut ctx = context();
        let mut bytes = BINARY_MAGIC.to_vec();
        bytes.push(u8::try_from(size_of::<usize>()).expect("fits"));
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; HEADER_SIZE]); // header with size 0
        let err = ctx
            .load_script("bad.lipc", Some(Box::new(VecInput::new(bytes))), false)
            .expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::Format);
        assert_eq!(err.message, "Malformed bytecode");
    }

    #[test]
    fn non_magic_streams_compile_as_source() {
        let mut ctx = context();
        let mut script = load_source(&mut ctx, "41");
        let mut vm = ctx.create_vm(None);
        assert_eq!(
            ctx.exec_script(&mut vm, &mut script).expect("runs"),
            Value::Number(41.0)
        );
        // Short sources (under four bytes) also fall through to the parser.
        let mut script = ctx
            .load_script("t.lip", Some(Box::new(SliceInput::new(b"7"))), false)
            .expect("loads");
        assert_eq!(
            ctx.exec_script(&mut vm, &mut script).expect("runs"),
            Value::Number(7.0)
        );
    }

    #[test]
    fn missing_files_surface_io_errors() {
        let mut ctx = context();
        let err = ctx
            .load_script("absent.lip", None, false)
            .expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::Io);
    }
}
