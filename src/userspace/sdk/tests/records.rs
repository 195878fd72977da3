//! ABI values serialized for tooling that stores what a fault handler saw.

use skerry_common::memlayout::{USTACKTOP, UTEXT};
use skerry_common::{Access, EnvId, FaultCode, PageState, PteFlags, PushRegs, SysError, UserFaultRecord};

#[test]
fn test_fault_record_as_json() {
    let record = UserFaultRecord {
        fault_va: UTEXT + 0x2345,
        err: (FaultCode::PROTECTION | FaultCode::WRITE | FaultCode::USER).bits(),
        regs: PushRegs {
            rax: 7,
            rdx: 0x1000,
            r15: u64::MAX,
            ..PushRegs::default()
        },
        rflags: 0x202,
        rip: UTEXT + 0x10,
        rsp: USTACKTOP - 8,
    };

    let json = serde_json::to_value(record).unwrap();
    assert_eq!(json["fault_va"], UTEXT + 0x2345);
    assert_eq!(json["regs"]["rax"], 7);
    assert_eq!(json["regs"]["r15"], u64::MAX);

    let back: UserFaultRecord = serde_json::from_value(json).unwrap();
    assert_eq!(back, record);
    assert_eq!(back.to_bytes(), record.to_bytes());
}

#[test]
fn test_page_states_and_flags_as_json() {
    let states = [
        PageState::Private(Access::ReadWrite),
        PageState::SharedDirect(Access::ReadOnly),
        PageState::CopyOnWrite,
    ];
    let json = serde_json::to_string(&states).unwrap();
    let back: Vec<PageState> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, states);

    let flags = PageState::CopyOnWrite.flags();
    let back: PteFlags = serde_json::from_str(&serde_json::to_string(&flags).unwrap()).unwrap();
    assert_eq!(back, flags);

    let code = FaultCode::WRITE | FaultCode::USER;
    let back: FaultCode = serde_json::from_str(&serde_json::to_string(&code).unwrap()).unwrap();
    assert_eq!(back, code);

    assert_eq!(serde_json::to_string(&SysError::NoMem).unwrap(), "\"NoMem\"");
    let id: EnvId = serde_json::from_str(&serde_json::to_string(&EnvId::CURRENT).unwrap()).unwrap();
    assert!(id.is_current());
}
