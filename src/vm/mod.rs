pub mod payload;

use std::sync::{Arc, Mutex};

use mlua::{Lua, LuaOptions, MultiValue, StdLib, Value};
use thiserror::Error;
use tracing::warn;

use crate::v1::chain::{Chain, ContractStaging};

/// Guest heap cap. A contract that allocates past this dies with an error.
const MEMORY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),
    #[error("contract has no function named '{0}'")]
    NoSuchFunction(String),
    #[error("bad contract call payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Everything the bridge functions need, attached to the runtime before
/// execution so guest code never names it.
pub struct VmContext {
    pub chain: Arc<Chain>,
    pub staging: Arc<Mutex<ContractStaging>>,
    pub contract_address: Vec<u8>,
    pub sender: Vec<u8>,
}

/// One sandboxed Lua runtime. The miner creates a fresh one per contract
/// transaction; nothing leaks from one execution into the next except what
/// went through `db_put`.
pub struct Vm {
    lua: Lua,
}

impl Vm {
    /// Opens only the pure standard libraries. Anything that can reach the
    /// filesystem, the process table or the module loader stays closed, and
    /// the handful of base functions that sneak filesystem access in through
    /// the back door are removed outright.
    pub fn new() -> Result<Vm, VmError> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )?;
        lua.set_memory_limit(MEMORY_LIMIT)?;

        let vm = Vm { lua };
        vm.scrub_globals()?;
        vm.register_bridge()?;

        Ok(vm)
    }

    fn scrub_globals(&self) -> Result<(), VmError> {
        let globals = self.lua.globals();
        for name in ["dofile", "loadfile", "require", "package", "io", "os"] {
            globals.set(name, Value::Nil)?;
        }

        Ok(())
    }

    pub fn set_context(&self, ctx: VmContext) {
        self.lua.set_app_data(ctx);
    }

    fn register_bridge(&self) -> Result<(), VmError> {
        let globals = self.lua.globals();

        let db_put = self.lua.create_function(
            |lua, (key, value): (mlua::String, mlua::String)| {
                let ctx = lua
                    .app_data_ref::<VmContext>()
                    .expect("VM context must be set before executing guest code");

                let mut staging = ctx.staging.lock().unwrap();
                staging.stage_state(
                    &ctx.contract_address,
                    key.as_bytes(),
                    value.as_bytes().to_vec(),
                );

                Ok(true)
            },
        )?;
        globals.set("db_put", db_put)?;

        let db_get = self.lua.create_function(|lua, key: mlua::String| {
            let ctx = lua
                .app_data_ref::<VmContext>()
                .expect("VM context must be set before executing guest code");

            // Writes from earlier calls in the same mining pass sit in the
            // staging overlay; they win over committed state.
            let staged = {
                let staging = ctx.staging.lock().unwrap();
                staging
                    .staged_state(&ctx.contract_address, key.as_bytes())
                    .cloned()
            };

            let value = match staged {
                Some(bytes) => Some(bytes),
                None => match ctx
                    .chain
                    .get_contract_state(&ctx.contract_address, key.as_bytes())
                {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(error = %err, "db_get could not read contract state");
                        None
                    }
                },
            };

            match value {
                Some(bytes) => Ok(Some(lua.create_string(&bytes)?)),
                None => Ok(None),
            }
        })?;
        globals.set("db_get", db_get)?;

        let get_sender = self.lua.create_function(|lua, ()| {
            let ctx = lua
                .app_data_ref::<VmContext>()
                .expect("VM context must be set before executing guest code");

            Ok(hex::encode(&ctx.sender))
        })?;
        globals.set("get_sender", get_sender)?;

        Ok(())
    }

    /// Runs the contract source once at the top level. Any error aborts the
    /// deploy; the caller throws away whatever was staged.
    pub fn run_deploy(&self, code: &[u8]) -> Result<(), VmError> {
        self.lua.load(code).exec()?;

        Ok(())
    }

    /// Loads the contract, resolves the named global and invokes it with the
    /// marshaled arguments. Return values are ignored; only success/failure
    /// and `db_put` side effects matter.
    pub fn run_call(
        &self,
        code: &[u8],
        function_name: &str,
        args: &[serde_json::Value],
    ) -> Result<(), VmError> {
        self.lua.load(code).exec()?;

        let func = match self.lua.globals().get::<_, Value>(function_name)? {
            Value::Function(func) => func,
            _ => return Err(VmError::NoSuchFunction(function_name.to_owned())),
        };

        let lua_args = self.marshal_args(args)?;
        func.call::<_, ()>(MultiValue::from_vec(lua_args))?;

        Ok(())
    }

    /// JSON string/number/bool map to their Lua counterparts; everything
    /// else becomes nil. Argument order is preserved.
    fn marshal_args(&self, args: &[serde_json::Value]) -> Result<Vec<Value>, VmError> {
        args.iter()
            .map(|arg| {
                Ok(match arg {
                    serde_json::Value::String(s) => Value::String(self.lua.create_string(s)?),
                    serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
                    serde_json::Value::Bool(b) => Value::Boolean(*b),
                    _ => Value::Nil,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{encode_address, Keypair};
    use serde_json::json;

    struct Fixture {
        chain: Arc<Chain>,
        staging: Arc<Mutex<ContractStaging>>,
        _dir: tempfile::TempDir,
    }

    const CONTRACT_ADDRESS: &[u8] = b"deploy-txn-id-0001";
    const SENDER: [u8; 20] = [0xab; 20];

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let address = encode_address(&Keypair::generate().public_key_bytes());
        let chain = Arc::new(Chain::init(&address, dir.path().to_str().unwrap()).unwrap());

        Fixture {
            chain,
            staging: Arc::new(Mutex::new(ContractStaging::default())),
            _dir: dir,
        }
    }

    fn make_vm(fixture: &Fixture) -> Vm {
        let vm = Vm::new().unwrap();
        vm.set_context(VmContext {
            chain: Arc::clone(&fixture.chain),
            staging: Arc::clone(&fixture.staging),
            contract_address: CONTRACT_ADDRESS.to_vec(),
            sender: SENDER.to_vec(),
        });
        vm
    }

    fn staged(fixture: &Fixture, key: &[u8]) -> Option<Vec<u8>> {
        fixture
            .staging
            .lock()
            .unwrap()
            .staged_state(CONTRACT_ADDRESS, key)
            .cloned()
    }

    const KV_CONTRACT: &str = r#"
        function set(key, val)
            db_put(key, val)
        end

        function get(key)
            return db_get(key)
        end

        function copy(from, to)
            db_put(to, db_get(from))
        end
    "#;

    #[test]
    fn deploy_then_call_stages_state() {
        let fixture = setup();

        let vm = make_vm(&fixture);
        vm.run_deploy(KV_CONTRACT.as_bytes()).unwrap();

        let vm = make_vm(&fixture);
        vm.run_call(
            KV_CONTRACT.as_bytes(),
            "set",
            &[json!("greeting"), json!("hello")],
        )
        .unwrap();

        assert_eq!(staged(&fixture, b"greeting"), Some(b"hello".to_vec()));
    }

    #[test]
    fn later_calls_observe_earlier_writes_in_the_same_pass() {
        let fixture = setup();

        let vm = make_vm(&fixture);
        vm.run_call(
            KV_CONTRACT.as_bytes(),
            "set",
            &[json!("first"), json!("value-1")],
        )
        .unwrap();

        let vm = make_vm(&fixture);
        vm.run_call(
            KV_CONTRACT.as_bytes(),
            "copy",
            &[json!("first"), json!("second")],
        )
        .unwrap();

        assert_eq!(staged(&fixture, b"second"), Some(b"value-1".to_vec()));
    }

    #[test]
    fn staged_state_shadows_committed_state() {
        let fixture = setup();

        fixture.staging.lock().unwrap().stage_state(
            CONTRACT_ADDRESS,
            b"color",
            b"blue".to_vec(),
        );

        let vm = make_vm(&fixture);
        vm.run_call(
            KV_CONTRACT.as_bytes(),
            "copy",
            &[json!("color"), json!("copied")],
        )
        .unwrap();

        assert_eq!(staged(&fixture, b"copied"), Some(b"blue".to_vec()));
    }

    #[test]
    fn get_sender_returns_the_hex_hash() {
        let fixture = setup();

        let vm = make_vm(&fixture);
        vm.run_call(
            br#"
                function who()
                    db_put("sender", get_sender())
                end
            "#,
            "who",
            &[],
        )
        .unwrap();

        assert_eq!(
            staged(&fixture, b"sender"),
            Some(hex::encode(SENDER).into_bytes())
        );
    }

    #[test]
    fn arguments_are_marshaled_in_order() {
        let fixture = setup();

        let vm = make_vm(&fixture);
        vm.run_call(
            br#"
                function check(s, n, b, x)
                    if s == "str" and n == 2 and b == true and x == nil then
                        db_put("ok", "1")
                    end
                end
            "#,
            "check",
            &[json!("str"), json!(2), json!(true), json!(null)],
        )
        .unwrap();

        assert_eq!(staged(&fixture, b"ok"), Some(b"1".to_vec()));
    }

    #[test]
    fn missing_function_is_an_error() {
        let fixture = setup();
        let vm = make_vm(&fixture);

        let result = vm.run_call(KV_CONTRACT.as_bytes(), "no_such_fn", &[]);
        assert!(matches!(result, Err(VmError::NoSuchFunction(_))));
    }

    #[test]
    fn syntax_errors_abort_the_deploy() {
        let fixture = setup();
        let vm = make_vm(&fixture);

        assert!(vm.run_deploy(b"function broken(").is_err());
        assert!(staged(&fixture, b"anything").is_none());
    }

    #[test]
    fn filesystem_and_process_access_are_unavailable() {
        let fixture = setup();

        for source in [
            r#"local f = io.open("/etc/passwd")"#,
            r#"os.execute("ls")"#,
            r#"require("io")"#,
            r#"dofile("/etc/passwd")"#,
            r#"loadfile("/etc/passwd")"#,
            r#"package.loadlib("libc.so", "system")"#,
        ] {
            let vm = make_vm(&fixture);
            assert!(
                vm.run_deploy(source.as_bytes()).is_err(),
                "guest escaped: {}",
                source
            );
        }
    }

    #[test]
    fn pure_stdlib_is_usable() {
        let fixture = setup();

        let vm = make_vm(&fixture);
        vm.run_deploy(
            br#"
                local words = { "a", "b", "c" }
                db_put("joined", table.concat(words, "-"))
                db_put("upper", string.upper("shout"))
                db_put("floor", tostring(math.floor(2.9)))
            "#,
        )
        .unwrap();

        assert_eq!(staged(&fixture, b"joined"), Some(b"a-b-c".to_vec()));
        assert_eq!(staged(&fixture, b"upper"), Some(b"SHOUT".to_vec()));
        assert_eq!(staged(&fixture, b"floor"), Some(b"2".to_vec()));
    }
}
