//! WMI process notification source
//!
//! Registers two asynchronous WQL notification queries against `ROOT\CIMV2`
//! (`__InstanceCreationEvent` and `__InstanceDeletionEvent` for
//! `Win32_Process` targets). WMI calls back into an `IWbemObjectSink`
//! implemented here on its own RPC threads; the sink is wrapped in an
//! unsecured-apartment stub so callbacks are accepted without client
//! authentication.
//!
//! Every COM object lives on one dedicated `wmi-subscription` thread that
//! enters the multithreaded apartment, registers the queries, and parks until
//! `unsubscribe` asks it to cancel them. The caller's apartment (often a host
//! UI thread in the STA) is never touched.

use crate::error::{ProcessMonitorError, Result, StringError};
use crate::monitor::source::{NotificationSource, RawProcessRecord, RecordHandler};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use windows::Win32::Foundation::RPC_E_TOO_LATE;
use windows::Win32::System::Com::{
    CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER, COINIT_MULTITHREADED, CoCreateInstance,
    CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket, CoUninitialize, EOAC_NONE,
    RPC_C_AUTHN_LEVEL_CALL, RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Wmi::{
    IUnsecuredApartment, IWbemClassObject, IWbemLocator, IWbemObjectSink, IWbemObjectSink_Impl,
    IWbemServices, UnsecuredApartment, WBEM_FLAG_SEND_STATUS, WbemLocator,
};
use windows::core::{BSTR, HRESULT, IUnknown, Interface, PCWSTR, Ref, VARIANT, implement, w};

const WMI_NAMESPACE: &str = "ROOT\\CIMV2";

const CREATION_QUERY: &str =
    "SELECT * FROM __InstanceCreationEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Process'";

const DELETION_QUERY: &str =
    "SELECT * FROM __InstanceDeletionEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Process'";

/// Process notification source backed by WMI event queries
pub struct WmiSource {
    subscription: Option<SubscriptionThread>,
}

/// Owner thread of the COM objects of one subscription
struct SubscriptionThread {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl WmiSource {
    /// Create an unsubscribed source
    pub fn new() -> Self {
        Self { subscription: None }
    }
}

impl Default for WmiSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSource for WmiSource {
    fn name(&self) -> &'static str {
        "wmi"
    }

    fn subscribe(&mut self, handler: RecordHandler) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("wmi-subscription".to_string())
            .spawn(move || run_subscription(handler, &ready_tx, &shutdown_rx))
            .map_err(ProcessMonitorError::ThreadSpawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("WMI process notifications subscribed");
                self.subscription = Some(SubscriptionThread {
                    shutdown: shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(ProcessMonitorError::Subscription(StringError::new(
                    "WMI subscription thread exited before registering queries",
                )))
            }
        }
    }

    fn unsubscribe(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };

        let _ = subscription.shutdown.send(());
        if subscription.handle.join().is_err() {
            warn!("WMI subscription thread panicked during cancellation");
        }
        info!("WMI process notifications unsubscribed");
    }
}

/// Body of the subscription thread
///
/// Reports the registration outcome on `ready`, then blocks until `shutdown`
/// fires and cancels the queries from the apartment that created them. If the
/// source is dropped without unsubscribing, the objects are leaked rather than
/// released.
#[expect(unsafe_code, reason = "Windows FFI for IWbemServices::CancelAsyncCall")]
fn run_subscription(handler: RecordHandler, ready: &Sender<Result<()>>, shutdown: &Receiver<()>) {
    let apartment = match Apartment::enter_mta() {
        Ok(apartment) => apartment,
        Err(e) => {
            error!("Failed to enter the COM multithreaded apartment: {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };
    initialize_security();

    let (services, stub_sink) = match register_queries(handler) {
        Ok(registered) => registered,
        Err(e) => {
            error!("WMI subscription failed: {e}");
            let _ = ready.send(Err(ProcessMonitorError::Subscription(Box::new(e))));
            return;
        }
    };

    let _ = ready.send(Ok(()));
    if shutdown.recv().is_err() {
        warn!("WMI source dropped without unsubscribe; leaving queries registered");
        std::mem::forget(stub_sink);
        std::mem::forget(services);
        std::mem::forget(apartment);
        return;
    }

    // SAFETY: both interfaces are live and were created in this apartment
    if let Err(e) = unsafe { services.CancelAsyncCall(&stub_sink) } {
        warn!("Failed to cancel WMI notification queries: {e}");
    }
    drop(stub_sink);
    drop(services);
    drop(apartment);
}

/// Configure process-wide COM security
///
/// Security already configured by the host is accepted.
#[expect(unsafe_code, reason = "Windows FFI for CoInitializeSecurity")]
fn initialize_security() {
    // SAFETY: plain COM runtime call with null optional parameters
    let result = unsafe {
        CoInitializeSecurity(
            None,
            -1,
            None,
            None,
            RPC_C_AUTHN_LEVEL_DEFAULT,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
            None,
        )
    };
    if let Err(e) = result
        && e.code() != RPC_E_TOO_LATE
    {
        // Not fatal: the host may have configured security differently
        warn!("CoInitializeSecurity failed: {e}");
    }
}

/// Connect to WMI and register both notification queries
///
/// Every interface acquired here is released on the error path by drop; a
/// creation query that was already registered is cancelled before returning.
#[expect(unsafe_code, reason = "Windows FFI for WMI connection and query registration")]
fn register_queries(
    handler: RecordHandler,
) -> windows::core::Result<(IWbemServices, IWbemObjectSink)> {
    // SAFETY: all pointers passed are owned interface references or null options
    unsafe {
        let locator: IWbemLocator = CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)?;
        let services = locator.ConnectServer(
            &BSTR::from(WMI_NAMESPACE),
            &BSTR::new(),
            &BSTR::new(),
            &BSTR::new(),
            0,
            &BSTR::new(),
            None,
        )?;

        CoSetProxyBlanket(
            &services,
            RPC_C_AUTHN_WINNT,
            RPC_C_AUTHZ_NONE,
            PCWSTR::null(),
            RPC_C_AUTHN_LEVEL_CALL,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
        )?;

        let apartment: IUnsecuredApartment =
            CoCreateInstance(&UnsecuredApartment, None, CLSCTX_LOCAL_SERVER)?;
        let sink: IWbemObjectSink = NotificationSink { handler }.into();
        let stub: IUnknown = apartment.CreateObjectStub(&sink)?;
        let stub_sink: IWbemObjectSink = stub.cast()?;

        services.ExecNotificationQueryAsync(
            &BSTR::from("WQL"),
            &BSTR::from(CREATION_QUERY),
            WBEM_FLAG_SEND_STATUS,
            None,
            &stub_sink,
        )?;

        if let Err(e) = services.ExecNotificationQueryAsync(
            &BSTR::from("WQL"),
            &BSTR::from(DELETION_QUERY),
            WBEM_FLAG_SEND_STATUS,
            None,
            &stub_sink,
        ) {
            let _ = services.CancelAsyncCall(&stub_sink);
            return Err(e);
        }

        Ok((services, stub_sink))
    }
}

/// Multithreaded COM apartment joined by the current thread
struct Apartment;

impl Apartment {
    #[expect(unsafe_code, reason = "Windows FFI for COM initialization")]
    fn enter_mta() -> Result<Self> {
        // SAFETY: plain COM runtime call with a null reserved parameter
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr.is_err() {
            return Err(ProcessMonitorError::Subscription(Box::new(
                windows::core::Error::from(hr),
            )));
        }
        Ok(Self)
    }
}

impl Drop for Apartment {
    #[expect(unsafe_code, reason = "Windows FFI for CoUninitialize")]
    fn drop(&mut self) {
        // SAFETY: balanced with the successful CoInitializeEx in `enter_mta` on this thread
        unsafe { CoUninitialize() };
    }
}

/// `IWbemObjectSink` forwarding notification batches to the record handler
#[implement(IWbemObjectSink)]
struct NotificationSink {
    handler: RecordHandler,
}

impl IWbemObjectSink_Impl for NotificationSink_Impl {
    #[expect(unsafe_code, reason = "WMI hands over a raw array of class objects")]
    fn Indicate(
        &self,
        lobjectcount: i32,
        apobjarray: *const Option<IWbemClassObject>,
    ) -> windows::core::Result<()> {
        let count = usize::try_from(lobjectcount).unwrap_or(0);
        if apobjarray.is_null() || count == 0 {
            return Ok(());
        }

        // SAFETY: WMI guarantees `lobjectcount` valid entries for the duration of the call
        let objects = unsafe { std::slice::from_raw_parts(apobjarray, count) };

        // Never let a fault unwind into the WMI delivery thread
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let records: Vec<RawProcessRecord> = objects
                .iter()
                .flatten()
                .filter_map(|object| match read_record(object) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        debug!("Skipping unreadable WMI notification: {e}");
                        None
                    }
                })
                .collect();
            if !records.is_empty() {
                (self.handler)(&records);
            }
        }));
        if outcome.is_err() {
            error!("WMI notification handler panicked; batch dropped");
        }

        Ok(())
    }

    fn SetStatus(
        &self,
        _lflags: i32,
        hresult: HRESULT,
        _strparam: &BSTR,
        _pobjparam: Ref<'_, IWbemClassObject>,
    ) -> windows::core::Result<()> {
        if hresult.is_err() {
            warn!("WMI notification query reported status {hresult}");
        }
        Ok(())
    }
}

/// Extract name, PID and origin class from one notification object
fn read_record(object: &IWbemClassObject) -> windows::core::Result<RawProcessRecord> {
    let origin_class = BSTR::try_from(&get_property(object, w!("__CLASS"))?)?.to_string();
    let target: IWbemClassObject =
        IUnknown::try_from(&get_property(object, w!("TargetInstance"))?)?.cast()?;
    let name = BSTR::try_from(&get_property(&target, w!("Name"))?)?.to_string();
    let pid = u32::try_from(&get_property(&target, w!("ProcessId"))?)?;

    Ok(RawProcessRecord {
        name,
        pid,
        origin_class,
    })
}

#[expect(unsafe_code, reason = "Windows FFI for IWbemClassObject::Get")]
fn get_property(object: &IWbemClassObject, name: PCWSTR) -> windows::core::Result<VARIANT> {
    let mut value = VARIANT::default();
    // SAFETY: `name` is a static wide string and `value` a valid out-parameter
    unsafe { object.Get(name, 0, &mut value, None, None)? };
    Ok(value)
}
